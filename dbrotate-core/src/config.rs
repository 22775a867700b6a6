//! Run configuration
//!
//! The configuration is assembled once at process start (by the CLI, from
//! flags and environment variables), validated, and then passed by reference
//! into the orchestrator. Nothing in the core reads the environment itself.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::artifact::{PayloadFormat, Tier};
use crate::{BackupError, Result};

/// Default number of members kept per tier
pub const DEFAULT_RETENTION_COUNT: usize = 5;
/// Default local backup root
pub const DEFAULT_LOCAL_DIR: &str = "/backups";
/// Default SSH port of the remote host
pub const DEFAULT_REMOTE_PORT: u16 = 22;
/// Default database user
pub const DEFAULT_DB_USER: &str = "root";
/// Keyword selecting every database on the server
pub const ALL_DATABASES: &str = "all";

/// A credential that must never be printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Which databases a dump covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseSelection {
    /// Every database on the server
    All,
    /// An explicit, non-empty set of database names
    Named(BTreeSet<String>),
}

impl DatabaseSelection {
    /// Parse a whitespace-separated database list or the `all` keyword
    ///
    /// # Errors
    /// `BackupError::Config` if the list is empty, mixes `all` with names, or
    /// contains a name that cannot be used in a file name.
    pub fn parse(list: &str) -> Result<Self> {
        let names: Vec<&str> = list.split_whitespace().collect();
        match names.as_slice() {
            [] => Err(BackupError::config("database list is empty")),
            [only] if *only == ALL_DATABASES => Ok(Self::All),
            _ => Self::named(names),
        }
    }

    /// Build an explicit selection
    pub fn named<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(BackupError::config("database list is empty"));
        }
        for name in &names {
            if name == ALL_DATABASES {
                return Err(BackupError::config(
                    "'all' cannot be combined with explicit database names",
                ));
            }
            if name.is_empty() || name.contains(['/', '\\', '.']) || name.chars().any(char::is_whitespace) {
                return Err(BackupError::config(format!("invalid database name '{name}'")));
            }
        }
        Ok(Self::Named(names))
    }

    /// Label of the backup set, used as the file name prefix
    ///
    /// Names are sorted and joined with `-`, so the same selection always
    /// lands in the same rotation regardless of the order it was given in.
    pub fn set_key(&self) -> String {
        match self {
            Self::All => ALL_DATABASES.to_string(),
            Self::Named(names) => names.iter().cloned().collect::<Vec<_>>().join("-"),
        }
    }
}

impl fmt::Display for DatabaseSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(ALL_DATABASES),
            Self::Named(names) => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                f.write_str(&names.join(" "))
            }
        }
    }
}

/// Per-tier capacity ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub daily: usize,
    pub weekly: usize,
    pub monthly: usize,
}

impl RetentionPolicy {
    pub fn new(daily: usize, weekly: usize, monthly: usize) -> Self {
        Self {
            daily,
            weekly,
            monthly,
        }
    }

    /// Build a policy from signed counts as they arrive from the outside
    ///
    /// # Errors
    /// `BackupError::Config` naming the first negative count.
    pub fn from_counts(daily: i64, weekly: i64, monthly: i64) -> Result<Self> {
        let check = |tier: Tier, count: i64| {
            usize::try_from(count).map_err(|_| {
                BackupError::config(format!("{tier} retention count must be non-negative, got {count}"))
            })
        };
        Ok(Self {
            daily: check(Tier::Daily, daily)?,
            weekly: check(Tier::Weekly, weekly)?,
            monthly: check(Tier::Monthly, monthly)?,
        })
    }

    /// Maximum number of members of `tier`
    pub fn capacity(&self, tier: Tier) -> usize {
        match tier {
            Tier::Daily => self.daily,
            Tier::Weekly => self.weekly,
            Tier::Monthly => self.monthly,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_RETENTION_COUNT,
            DEFAULT_RETENTION_COUNT,
            DEFAULT_RETENTION_COUNT,
        )
    }
}

/// Connection settings for the dump utility.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseConfig {
    /// Database host; the dump utility's default when unset
    pub host: Option<String>,
    pub user: String,
    #[serde(skip)]
    pub password: Option<Secret>,
    pub databases: DatabaseSelection,
}

impl DatabaseConfig {
    pub fn new(databases: DatabaseSelection) -> Self {
        Self {
            host: None,
            user: DEFAULT_DB_USER.to_string(),
            password: None,
            databases,
        }
    }
}

/// How to authenticate against the remote host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Credential {
    /// Private key file passed to ssh/scp
    KeyFile(PathBuf),
    /// Password, fed to ssh/scp through `sshpass`
    Password(Secret),
    /// Whatever identity the SSH agent or default key provides
    #[default]
    Default,
}

impl Credential {
    fn describe(&self) -> &'static str {
        match self {
            Credential::KeyFile(_) => "key-file",
            Credential::Password(_) => "password",
            Credential::Default => "default",
        }
    }
}

impl Serialize for Credential {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.describe())
    }
}

/// Remote store settings.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    /// Backup root on the remote host
    pub dir: PathBuf,
    pub credential: Credential,
}

/// The complete, immutable configuration of one run.
#[derive(Debug, Clone, Serialize)]
pub struct BackupConfig {
    pub database: DatabaseConfig,
    pub retention: RetentionPolicy,
    /// Local backup root; also holds the run lock and the staging area
    pub local_dir: PathBuf,
    pub skip_local: bool,
    pub skip_remote: bool,
    /// Required unless `skip_remote` is set
    pub remote: Option<RemoteConfig>,
    /// Gzip the dump before storing it
    pub compress: bool,
}

impl BackupConfig {
    /// Configuration with defaults for everything but the database selection
    pub fn new(databases: DatabaseSelection) -> Self {
        Self {
            database: DatabaseConfig::new(databases),
            retention: RetentionPolicy::default(),
            local_dir: PathBuf::from(DEFAULT_LOCAL_DIR),
            skip_local: false,
            skip_remote: false,
            remote: None,
            compress: false,
        }
    }

    /// Encoding the dump is stored in
    pub fn payload_format(&self) -> PayloadFormat {
        if self.compress {
            PayloadFormat::Gzip
        } else {
            PayloadFormat::Plain
        }
    }

    /// Validate the configuration
    ///
    /// Runs before any external call is made.
    pub fn validate(&self) -> Result<()> {
        if self.skip_local && self.skip_remote {
            return Err(BackupError::config(
                "skip_local and skip_remote are both set; the backup would not be stored anywhere",
            ));
        }
        if self.local_dir.as_os_str().is_empty() {
            return Err(BackupError::config("local backup directory is empty"));
        }
        if self.database.user.trim().is_empty() {
            return Err(BackupError::config("database user is empty"));
        }
        if let DatabaseSelection::Named(names) = &self.database.databases {
            if names.is_empty() {
                return Err(BackupError::config("database list is empty"));
            }
        }

        if !self.skip_remote {
            let remote = self.remote.as_ref().ok_or_else(|| {
                BackupError::config("remote host settings are required unless skip_remote is set")
            })?;
            if remote.host.trim().is_empty() {
                return Err(BackupError::config("remote host is empty"));
            }
            if remote.user.trim().is_empty() {
                return Err(BackupError::config("remote user is empty"));
            }
            if remote.port == 0 {
                return Err(BackupError::config("remote port must be between 1 and 65535"));
            }
            if remote.dir.as_os_str().is_empty() {
                return Err(BackupError::config("remote directory is empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> RemoteConfig {
        RemoteConfig {
            host: "10.0.0.5".to_string(),
            user: "backup".to_string(),
            port: DEFAULT_REMOTE_PORT,
            dir: PathBuf::from("/srv/backups"),
            credential: Credential::Default,
        }
    }

    fn valid_config() -> BackupConfig {
        let mut config = BackupConfig::new(DatabaseSelection::All);
        config.remote = Some(remote());
        config
    }

    #[test]
    fn test_parse_all_keyword() {
        assert_eq!(DatabaseSelection::parse("all").unwrap(), DatabaseSelection::All);
        assert_eq!(DatabaseSelection::parse("  all ").unwrap(), DatabaseSelection::All);
    }

    #[test]
    fn test_parse_named_sorted_set_key() {
        let selection = DatabaseSelection::parse("users billing  audit").unwrap();
        assert_eq!(selection.set_key(), "audit-billing-users");
        assert_eq!(selection.to_string(), "audit billing users");
    }

    #[test]
    fn test_parse_rejects_empty_and_mixed() {
        assert!(DatabaseSelection::parse("").is_err());
        assert!(DatabaseSelection::parse("   ").is_err());
        assert!(DatabaseSelection::parse("all users").is_err());
        assert!(DatabaseSelection::named(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_parse_rejects_path_like_names() {
        assert!(DatabaseSelection::parse("../etc").is_err());
        assert!(DatabaseSelection::parse("a/b").is_err());
    }

    #[test]
    fn test_retention_from_counts() {
        let policy = RetentionPolicy::from_counts(7, 4, 0).unwrap();
        assert_eq!(policy.capacity(Tier::Daily), 7);
        assert_eq!(policy.capacity(Tier::Weekly), 4);
        assert_eq!(policy.capacity(Tier::Monthly), 0);

        let err = RetentionPolicy::from_counts(5, -1, 5).unwrap_err();
        assert!(err.to_string().contains("weekly"));
    }

    #[test]
    fn test_defaults() {
        let config = BackupConfig::new(DatabaseSelection::All);
        assert_eq!(config.retention, RetentionPolicy::new(5, 5, 5));
        assert_eq!(config.local_dir, PathBuf::from("/backups"));
        assert_eq!(config.database.user, "root");
        assert!(!config.skip_local);
        assert!(!config.skip_remote);
        assert_eq!(config.payload_format(), PayloadFormat::Plain);
    }

    #[test]
    fn test_validate_both_skips_rejected() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());

        config.skip_local = true;
        config.skip_remote = true;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn test_validate_remote_required_unless_skipped() {
        let mut config = BackupConfig::new(DatabaseSelection::All);
        assert!(config.validate().is_err());

        config.skip_remote = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_remote_fields() {
        let mut config = valid_config();
        config.remote.as_mut().unwrap().port = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.remote.as_mut().unwrap().host = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secrets_are_not_printed() {
        let mut config = valid_config();
        config.database.password = Some(Secret::new("hunter2"));
        config.remote.as_mut().unwrap().credential = Credential::Password(Secret::new("s3cret"));

        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("s3cret"));

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("s3cret"));
        assert!(json.contains("\"credential\":\"password\""));
    }
}
