/*!
dbrotate CLI - scheduled database dumps with daily, weekly and monthly rotation.

Every option can be given as a flag or through the environment variable named
next to it in `--help`; flags win over the environment, which wins over the
defaults. Meant to be started by cron, a systemd timer or a container
scheduler: one invocation is one backup run.
*/

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dbrotate_core::{
    init_observability, ArtifactName, BackupConfig, BackupMetrics, Credential, DatabaseConfig,
    DatabaseSelection, LogFormat, LocalDirBackend, MysqlDump, OpenSshTransport, Orchestrator,
    RemoteBackend, RemoteConfig, RetentionPolicy, RetentionStore, RunReport, Secret, StoreBackend,
    SystemClock,
};
use tabled::{Table, Tabled};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dbrotate")]
#[command(about = "Database backups with daily, weekly and monthly rotation, locally and over SSH")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format: plain or json
    #[arg(long, global = true, default_value = "plain", env = "LOG_FORMAT", value_parser = parse_log_format)]
    log_format: LogFormat,

    /// Write Prometheus metrics to this file (node-exporter textfile format)
    #[arg(long, global = true, env = "METRICS_FILE")]
    metrics_file: Option<PathBuf>,

    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Backup settings shared by every subcommand
#[derive(Args, Debug, Clone)]
struct Settings {
    /// Number of daily backups to retain
    #[arg(long, global = true, env = "DLY_BACKUP_COUNT", default_value = "5", value_parser = parse_count, allow_negative_numbers = true)]
    dly_backup_count: i64,

    /// Number of weekly backups to retain
    #[arg(long, global = true, env = "WLY_BACKUP_COUNT", default_value = "5", value_parser = parse_count, allow_negative_numbers = true)]
    wly_backup_count: i64,

    /// Number of monthly backups to retain
    #[arg(long, global = true, env = "MLY_BACKUP_COUNT", default_value = "5", value_parser = parse_count, allow_negative_numbers = true)]
    mly_backup_count: i64,

    /// Database host, as accepted by `mysqldump -h`
    #[arg(long, global = true, env = "IP_HOST")]
    ip_host: Option<String>,

    /// Database user to run the dump as
    #[arg(long, global = true, env = "DB_USER", default_value = "root")]
    db_user: String,

    /// Database password (passed to mysqldump through MYSQL_PWD)
    #[arg(long, global = true, env = "PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Space separated list of databases, or `all`
    #[arg(long, global = true, env = "DATABASES", default_value = "all")]
    databases: String,

    /// Local backup root
    #[arg(long, global = true, env = "DIR_LOCAL", default_value = "/backups")]
    dir_local: PathBuf,

    /// Do not keep backups locally
    #[arg(long, global = true, env = "SKIP_LOCAL")]
    skip_local: bool,

    /// Do not copy backups to the remote host
    #[arg(long, global = true, env = "SKIP_REMOTE")]
    skip_remote: bool,

    /// Remote host to store backups on
    #[arg(long, global = true, env = "IP_REMOTE")]
    ip_remote: Option<String>,

    /// SSH user on the remote host
    #[arg(long, global = true, env = "USER_REMOTE")]
    user_remote: Option<String>,

    /// SSH password on the remote host (used through sshpass)
    #[arg(long, global = true, env = "PASS_REMOTE", hide_env_values = true)]
    pass_remote: Option<String>,

    /// SSH port of the remote host
    #[arg(long, global = true, env = "PORT_REMOTE", default_value_t = 22)]
    port_remote: u16,

    /// Remote backup root
    #[arg(long, global = true, env = "DIR_REMOTE")]
    dir_remote: Option<PathBuf>,

    /// SSH private key; a bare file name is looked up in `.ssh/`
    #[arg(long, global = true, env = "CREDENTIAL_FILE")]
    credential_file: Option<PathBuf>,

    /// Gzip dumps before storing them
    #[arg(long, global = true, env = "COMPRESS")]
    compress: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ReportFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Dump, store and rotate (the default when no subcommand is given)
    Run {
        /// Print the run report on stdout
        #[arg(long, value_enum)]
        report: Option<ReportFormat>,
    },
    /// List the backups held by a store
    List {
        /// Inspect the remote store instead of the local one
        #[arg(long)]
        remote: bool,
    },
    /// Show what a backup taken now would do, without taking it
    Plan {
        /// Plan against the remote store instead of the local one
        #[arg(long)]
        remote: bool,
    },
}

#[derive(Tabled)]
struct ArtifactRow {
    #[tabled(rename = "Artifact")]
    name: String,
    #[tabled(rename = "Captured (UTC)")]
    captured: String,
    #[tabled(rename = "Tiers")]
    tiers: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[derive(Tabled)]
struct EvictionRow {
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Evicted")]
    artifact: String,
    #[tabled(rename = "Payload deleted")]
    deleted: String,
}

#[derive(Tabled)]
struct StoreRow {
    #[tabled(rename = "Store")]
    store: String,
    #[tabled(rename = "Location")]
    location: String,
    #[tabled(rename = "Joined")]
    joined: String,
    #[tabled(rename = "Evicted")]
    evicted: usize,
    #[tabled(rename = "Deleted")]
    deleted: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_observability(cli.verbose, cli.log_format) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = build_config(&cli.settings)?;
    let metrics = match &cli.metrics_file {
        Some(_) => Some(BackupMetrics::install()?),
        None => None,
    };

    let code = match cli.command.unwrap_or(Commands::Run { report: None }) {
        Commands::Run { report } => {
            log_banner(&config);
            run_backup(config, report).await?
        }
        Commands::List { remote } => {
            list_backups(&config, remote).await?;
            ExitCode::SUCCESS
        }
        Commands::Plan { remote } => {
            plan_backup(&config, remote).await?;
            ExitCode::SUCCESS
        }
    };

    if let (Some(metrics), Some(path)) = (metrics, &cli.metrics_file) {
        metrics
            .write_textfile(path)
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }
    Ok(code)
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse().map_err(|e: dbrotate_core::BackupError| e.to_string())
}

/// Accepts integers and integral floats ("5", "5.0"), keeping the sign
fn parse_count(value: &str) -> Result<i64, String> {
    let value = value.trim();
    if let Ok(count) = value.parse::<i64>() {
        return Ok(count);
    }
    match value.parse::<f64>() {
        Ok(count) if count.fract() == 0.0 && count.abs() < i64::MAX as f64 => Ok(count as i64),
        _ => Err(format!("'{value}' is not a whole number")),
    }
}

fn resolve_key_path(file: &Path) -> PathBuf {
    if file.is_relative() && file.components().count() == 1 {
        Path::new(".ssh").join(file)
    } else {
        file.to_path_buf()
    }
}

fn build_config(settings: &Settings) -> anyhow::Result<BackupConfig> {
    let databases = DatabaseSelection::parse(&settings.databases)?;

    let mut database = DatabaseConfig::new(databases);
    database.host = settings.ip_host.clone().filter(|h| !h.trim().is_empty());
    database.user = settings.db_user.clone();
    database.password = settings.password.clone().map(Secret::new);

    let credential = match (&settings.credential_file, &settings.pass_remote) {
        (Some(file), _) => Credential::KeyFile(resolve_key_path(file)),
        (None, Some(password)) => Credential::Password(Secret::new(password.clone())),
        (None, None) => Credential::Default,
    };

    let remote_given = settings.ip_remote.is_some() || settings.user_remote.is_some() || settings.dir_remote.is_some();
    let remote = (remote_given || !settings.skip_remote).then(|| RemoteConfig {
        host: settings.ip_remote.clone().unwrap_or_default(),
        user: settings.user_remote.clone().unwrap_or_default(),
        port: settings.port_remote,
        dir: settings.dir_remote.clone().unwrap_or_default(),
        credential,
    });

    Ok(BackupConfig {
        database,
        retention: RetentionPolicy::from_counts(
            settings.dly_backup_count,
            settings.wly_backup_count,
            settings.mly_backup_count,
        )?,
        local_dir: settings.dir_local.clone(),
        skip_local: settings.skip_local,
        skip_remote: settings.skip_remote,
        remote,
        compress: settings.compress,
    })
}

fn log_banner(config: &BackupConfig) {
    let remote = config.remote.as_ref();
    info!(
        db_host = config.database.host.as_deref().unwrap_or("(default)"),
        db_user = %config.database.user,
        password_passed = config.database.password.is_some(),
        databases = %config.database.databases,
        local_dir = %config.local_dir.display(),
        skip_local = config.skip_local,
        skip_remote = config.skip_remote,
        remote_host = remote.map(|r| r.host.as_str()).unwrap_or("-"),
        remote_port = remote.map(|r| r.port).unwrap_or_default(),
        remote_user = remote.map(|r| r.user.as_str()).unwrap_or("-"),
        remote_dir = %remote.map(|r| r.dir.display().to_string()).unwrap_or_else(|| "-".to_string()),
        credential = ?remote.map(|r| match &r.credential {
            Credential::KeyFile(path) => format!("key-file {}", path.display()),
            Credential::Password(_) => "password".to_string(),
            Credential::Default => "default".to_string(),
        }),
        daily = config.retention.daily,
        weekly = config.retention.weekly,
        monthly = config.retention.monthly,
        compress = config.compress,
        "dbrotate starting"
    );
}

async fn run_backup(config: BackupConfig, report_format: Option<ReportFormat>) -> anyhow::Result<ExitCode> {
    let dumper = MysqlDump::new(&config.database);
    let transport = if config.skip_remote {
        None
    } else {
        config.remote.as_ref().map(|r| Arc::new(OpenSshTransport::new(r)))
    };

    let orchestrator = Orchestrator::new(config, dumper, transport, SystemClock);
    match orchestrator.run().await {
        Ok(report) => {
            if report.has_warnings() {
                warn!(warnings = report.warnings.len(), "backup finished with warnings");
            }
            match report_format {
                Some(ReportFormat::Json) => println!("{}", serde_json::to_string_pretty(&report)?),
                Some(ReportFormat::Text) => print_report(&report),
                None => {}
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_report(report: &RunReport) {
    println!(
        "Backup {} ({}, sha256 {})",
        report.artifact.file_name(),
        format_size(report.artifact.size_bytes),
        report.artifact.content_hash
    );

    let rows: Vec<StoreRow> = [&report.local, &report.remote]
        .into_iter()
        .flatten()
        .map(|outcome| StoreRow {
            store: outcome.store.to_string(),
            location: outcome.location.clone(),
            joined: outcome.report.joined.to_string(),
            evicted: outcome.report.evicted.len(),
            deleted: outcome.report.deleted.len(),
        })
        .collect();
    if !rows.is_empty() {
        println!("{}", Table::new(rows));
    }

    if report.has_warnings() {
        for warning in &report.warnings {
            println!("warning: {warning}");
        }
    } else {
        println!("No warnings");
    }
}

fn require_remote(config: &BackupConfig) -> anyhow::Result<&RemoteConfig> {
    let remote = config
        .remote
        .as_ref()
        .ok_or_else(|| anyhow!("remote settings (--ip-remote, --user-remote, --dir-remote) are required"))?;
    if remote.host.is_empty() || remote.user.is_empty() || remote.dir.as_os_str().is_empty() {
        return Err(anyhow!("remote settings (--ip-remote, --user-remote, --dir-remote) are required"));
    }
    Ok(remote)
}

async fn open_store<B: StoreBackend>(backend: B, config: &BackupConfig) -> anyhow::Result<RetentionStore<B>> {
    let location = backend.location();
    RetentionStore::open(backend, config.retention, config.database.databases.set_key())
        .await
        .with_context(|| format!("Failed to read store at {location}"))
}

async fn list_backups(config: &BackupConfig, remote: bool) -> anyhow::Result<()> {
    if remote {
        let remote = require_remote(config)?;
        let transport = Arc::new(OpenSshTransport::new(remote));
        let store = open_store(RemoteBackend::new(transport, &remote.dir), config).await?;
        print_inventory(&store, None);
    } else {
        let backend = LocalDirBackend::new(&config.local_dir);
        let store = open_store(backend.clone(), config).await?;
        print_inventory(&store, Some(&backend));
    }
    Ok(())
}

fn print_inventory<B: StoreBackend>(store: &RetentionStore<B>, local: Option<&LocalDirBackend>) {
    let inventory = store.inventory();
    let artifacts = inventory.artifacts();
    if artifacts.is_empty() {
        println!("No backups of '{}' found at {}", store.set_key(), store.backend().location());
        return;
    }

    let rows: Vec<ArtifactRow> = artifacts
        .iter()
        .rev()
        .map(|name| {
            let tiers = inventory.tiers_of(name);
            let size = local
                .and_then(|backend| {
                    let tier = tiers.iter().next()?;
                    std::fs::metadata(backend.tier_dir(tier).join(name.file_name())).ok()
                })
                .map(|meta| format_size(meta.len()))
                .unwrap_or_else(|| "-".to_string());
            ArtifactRow {
                name: name.file_name(),
                captured: format_timestamp(name.captured_at),
                tiers: tiers.to_string(),
                size,
            }
        })
        .collect();
    println!("{}", Table::new(rows));
}

async fn plan_backup(config: &BackupConfig, remote: bool) -> anyhow::Result<()> {
    if remote {
        let remote = require_remote(config)?;
        let transport = Arc::new(OpenSshTransport::new(remote));
        let store = open_store(RemoteBackend::new(transport, &remote.dir), config).await?;
        print_plan(&store, config);
    } else {
        let store = open_store(LocalDirBackend::new(&config.local_dir), config).await?;
        print_plan(&store, config);
    }
    Ok(())
}

fn print_plan<B: StoreBackend>(store: &RetentionStore<B>, config: &BackupConfig) {
    let now = Utc::now();
    let name = ArtifactName::new(store.set_key(), now, config.payload_format());
    let tiers = store.classify(now);
    let report = store.plan(&name, &tiers);

    println!("Store: {} ({})", store.kind(), store.backend().location());
    match &report.admitted_as {
        Some(file_name) => println!("A backup taken now would be stored as {file_name} in: {}", report.joined),
        None => println!("A backup taken now would not be kept in any tier"),
    }

    if report.evicted.is_empty() {
        println!("Nothing would be evicted");
        return;
    }
    let rows: Vec<EvictionRow> = report
        .evicted
        .iter()
        .map(|eviction| EvictionRow {
            tier: eviction.tier.to_string(),
            artifact: eviction.artifact.clone(),
            deleted: if report.deleted.contains(&eviction.artifact) {
                "yes".to_string()
            } else {
                "no".to_string()
            },
        })
        .collect();
    println!("{}", Table::new(rows));
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
