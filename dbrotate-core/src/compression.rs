/*!
Compression of staged dump files.

Dumps can be large, so compression works file to file with streaming
encoders rather than on in-memory buffers. The default is to store the dump
as emitted; gzip is opt-in and changes the artifact's extension to
`.sql.gz`.
*/

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

use flate2::{write::GzEncoder, Compression};

use crate::artifact::PayloadFormat;
use crate::{BackupError, Result};

/// Compression applied to a staged dump before it is admitted
pub trait CompressionAdapter: Send + Sync {
    /// Encode `source` into `target`
    ///
    /// # Arguments
    /// * `source` - The raw dump file
    /// * `target` - Where the encoded payload is written; replaced if present
    ///
    /// # Returns
    /// Number of bytes written to `target`
    fn compress_file(&self, source: &Path, target: &Path) -> Result<u64>;

    /// Payload format the output is stored as
    fn format(&self) -> PayloadFormat;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;
}

/// Build the adapter for a payload format
pub fn adapter_for(format: PayloadFormat) -> Box<dyn CompressionAdapter> {
    match format {
        PayloadFormat::Plain => Box::new(NoCompression),
        PayloadFormat::Gzip => Box::new(GzipCompressor::new()),
    }
}

/// Gzip compression adapter
///
/// # Example
/// ```rust,no_run
/// use dbrotate_core::compression::{CompressionAdapter, GzipCompressor};
/// use std::path::Path;
///
/// let written = GzipCompressor::new()
///     .compress_file(Path::new("dump.sql"), Path::new("dump.sql.gz"))?;
/// # Ok::<(), dbrotate_core::BackupError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress_file(&self, source: &Path, target: &Path) -> Result<u64> {
        let mut reader = BufReader::new(open(source)?);
        let mut encoder = GzEncoder::new(BufWriter::new(create(target)?), self.compression_level);

        io::copy(&mut reader, &mut encoder).map_err(|e| {
            BackupError::dump(format!("Failed to write data for compression: {e}"))
        })?;

        let writer = encoder
            .finish()
            .map_err(|e| BackupError::dump(format!("Failed to finish compression: {e}")))?;
        let file = writer
            .into_inner()
            .map_err(|e| BackupError::dump(format!("Failed to flush {}: {}", target.display(), e.error())))?;
        file.sync_all()?;
        Ok(file.metadata()?.len())
    }

    fn format(&self) -> PayloadFormat {
        PayloadFormat::Gzip
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Stores the dump unchanged
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl CompressionAdapter for NoCompression {
    fn compress_file(&self, source: &Path, target: &Path) -> Result<u64> {
        if source == target {
            return Ok(std::fs::metadata(source)?.len());
        }
        std::fs::rename(source, target)
            .map_err(|e| BackupError::dump(format!("Failed to move {}: {e}", source.display())))?;
        Ok(std::fs::metadata(target)?.len())
    }

    fn format(&self) -> PayloadFormat {
        PayloadFormat::Plain
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| BackupError::dump(format!("Failed to open {}: {e}", path.display())))
}

fn create(path: &Path) -> Result<File> {
    File::create(path).map_err(|e| BackupError::dump(format!("Failed to create {}: {e}", path.display())))
}
