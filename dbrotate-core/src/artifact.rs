/*!
Backup artifacts, retention tiers and the on-disk naming scheme.

An artifact file name encodes everything needed to rebuild tier membership
from a directory listing:

```text
<set>_<YYYYMMDD>T<HHMMSS><mmm>Z[-<seq>].sql[.gz]
```

`set` is the backup-set label (see [`DatabaseSelection::set_key`]), the stamp
is the UTC capture instant with millisecond precision and `seq` breaks ties
between artifacts captured in the same millisecond, in insertion order.

[`DatabaseSelection::set_key`]: crate::config::DatabaseSelection::set_key
*/

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::DatabaseSelection;

const STAMP_SECONDS_FORMAT: &str = "%Y%m%dT%H%M%S";

/// A retention bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
}

impl Tier {
    /// Every tier, in rotation order (most frequent first)
    pub const ALL: [Tier; 3] = [Tier::Daily, Tier::Weekly, Tier::Monthly];

    /// Name of the tier's directory under a store root
    pub fn dir_name(self) -> &'static str {
        match self {
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// The set of tiers an artifact belongs to, or should join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierSet(BTreeSet<Tier>);

impl TierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tier: Tier) -> bool {
        self.0.insert(tier)
    }

    pub fn remove(&mut self, tier: Tier) -> bool {
        self.0.remove(&tier)
    }

    pub fn contains(&self, tier: Tier) -> bool {
        self.0.contains(&tier)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Tier> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Tier> for TierSet {
    fn from_iter<I: IntoIterator<Item = Tier>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for TierSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.iter().map(Tier::dir_name).collect();
        f.write_str(&names.join("+"))
    }
}

/// Encoding of the stored payload, reflected in the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Raw SQL as emitted by the dump utility
    Plain,
    /// Gzip-compressed SQL
    Gzip,
}

impl PayloadFormat {
    pub fn extension(self) -> &'static str {
        match self {
            PayloadFormat::Plain => "sql",
            PayloadFormat::Gzip => "sql.gz",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "sql" => Some(PayloadFormat::Plain),
            "sql.gz" => Some(PayloadFormat::Gzip),
            _ => None,
        }
    }
}

/// Identity of a stored artifact, recoverable from its file name.
///
/// Ordering is by capture instant, then by insertion sequence, which is the
/// order tier members are kept and evicted in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactName {
    /// Backup-set label the artifact belongs to
    pub set_key: String,
    /// UTC capture instant, truncated to milliseconds
    pub captured_at: DateTime<Utc>,
    /// Tie-breaker for artifacts captured in the same millisecond
    pub seq: u32,
    /// Payload encoding
    pub format: PayloadFormat,
}

impl ArtifactName {
    /// Create a name for an artifact captured at `captured_at`
    ///
    /// The instant is truncated to millisecond precision so the name
    /// round-trips through [`ArtifactName::parse`].
    pub fn new<S: Into<String>>(set_key: S, captured_at: DateTime<Utc>, format: PayloadFormat) -> Self {
        let millis = captured_at.timestamp_millis();
        let captured_at = DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(captured_at);
        Self {
            set_key: set_key.into(),
            captured_at,
            seq: 0,
            format,
        }
    }

    /// Same artifact identity with a different tie-breaker
    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    /// Render the file name used in every tier directory
    pub fn file_name(&self) -> String {
        let stamp = format!(
            "{}{:03}Z",
            self.captured_at.format(STAMP_SECONDS_FORMAT),
            self.captured_at.timestamp_subsec_millis()
        );
        if self.seq == 0 {
            format!("{}_{}.{}", self.set_key, stamp, self.format.extension())
        } else {
            format!("{}_{}-{}.{}", self.set_key, stamp, self.seq, self.format.extension())
        }
    }

    /// Parse a file name produced by [`ArtifactName::file_name`]
    ///
    /// Returns `None` for anything else, including hidden temporaries.
    pub fn parse(file_name: &str) -> Option<Self> {
        if file_name.starts_with('.') {
            return None;
        }
        let (set_key, rest) = file_name.rsplit_once('_')?;
        if set_key.is_empty() {
            return None;
        }
        let (stamp_and_seq, ext) = rest.split_once('.')?;
        let format = PayloadFormat::from_extension(ext)?;

        let (stamp, seq) = match stamp_and_seq.split_once('-') {
            Some((stamp, seq)) => (stamp, seq.parse::<u32>().ok().filter(|s| *s > 0)?),
            None => (stamp_and_seq, 0),
        };

        // 15 chars of date/time, 3 of millis, trailing 'Z'
        let stamp = stamp.strip_suffix('Z')?;
        if stamp.len() != 18 || !stamp.is_char_boundary(15) {
            return None;
        }
        let (seconds, millis) = stamp.split_at(15);
        let seconds = NaiveDateTime::parse_from_str(seconds, STAMP_SECONDS_FORMAT).ok()?;
        if !millis.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let millis: i64 = millis.parse().ok()?;
        let captured_at = DateTime::<Utc>::from_timestamp_millis(
            seconds.and_utc().timestamp_millis() + millis,
        )?;

        Some(Self {
            set_key: set_key.to_string(),
            captured_at,
            seq,
            format,
        })
    }

    fn sort_key(&self) -> (DateTime<Utc>, u32, &str, PayloadFormat) {
        (self.captured_at, self.seq, &self.set_key, self.format)
    }
}

impl Ord for ArtifactName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for ArtifactName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// One backup unit produced by a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Identity and file name of the artifact
    pub name: ArtifactName,

    /// Databases included in the dump
    pub databases: DatabaseSelection,

    /// Where the payload currently lives (the staging file until admitted)
    pub payload_ref: PathBuf,

    /// Tiers that reference this artifact; empty until classified
    pub tiers: TierSet,

    /// Size of the payload in bytes
    pub size_bytes: u64,

    /// SHA-256 of the payload as stored
    pub content_hash: String,
}

impl Artifact {
    /// Capture instant of the artifact
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.name.captured_at
    }

    /// File name used in every store
    pub fn file_name(&self) -> String {
        self.name.file_name()
    }

    /// Stream a file through SHA-256, returning the hex digest and byte count
    ///
    /// This is blocking I/O; async callers run it on the blocking pool.
    pub fn digest_file(path: &Path) -> io::Result<(String, u64)> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let size = io::copy(&mut file, &mut hasher)?;
        Ok((format!("{:x}", hasher.finalize()), size))
    }
}
