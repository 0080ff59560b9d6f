//! Environment configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{page::DEFAULT_PAGE_SIZE, Result, VesperError};

/// Name of the optional per-environment options file.
pub const OPTIONS_FILE_NAME: &str = "vesper.toml";

/// When a commit becomes durable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Fsync the journal before a commit returns.
    #[default]
    Full,
    /// Append without fsync; the OS decides when bytes reach the medium.
    /// Recovery still sees a record-aligned prefix.
    Lazy,
    /// No journal syncs at all; for ephemeral stores and tests.
    None,
}

impl Durability {
    /// Returns the string form used in options files.
    pub fn as_str(self) -> &'static str {
        match self {
            Durability::Full => "full",
            Durability::Lazy => "lazy",
            Durability::None => "none",
        }
    }
}

/// Configuration supplied when opening an environment.
#[derive(Clone, Debug)]
pub struct EnvOptions {
    /// Page size in bytes; power of two between 512 and 65536.
    pub page_size: u32,
    /// Size threshold at which the active journal file is retired.
    pub max_journal_file_size: u64,
    /// Size of each scratch file.
    pub max_scratch_file_size: u64,
    /// Commit durability mode.
    pub durability: Durability,
    /// Whether journal payloads are snappy-compressed.
    pub compress_journal: bool,
    /// Whether checkpointed journal files are kept for reuse.
    pub recycle_journals: bool,
    /// Upper bound on the recycle pool.
    pub max_recycled_journals: usize,
    /// Interval of the background flusher; `None` means manual flushing.
    pub flush_interval: Option<Duration>,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_journal_file_size: 16 * 1024 * 1024,
            max_scratch_file_size: 64 * 1024 * 1024,
            durability: Durability::Full,
            compress_journal: true,
            recycle_journals: true,
            max_recycled_journals: 4,
            flush_interval: None,
        }
    }
}

impl EnvOptions {
    /// Creates options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the page size.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the journal rotation threshold.
    pub fn max_journal_file_size(mut self, bytes: u64) -> Self {
        self.max_journal_file_size = bytes;
        self
    }

    /// Sets the scratch file size.
    pub fn max_scratch_file_size(mut self, bytes: u64) -> Self {
        self.max_scratch_file_size = bytes;
        self
    }

    /// Sets the durability mode.
    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Enables or disables journal payload compression.
    pub fn compress_journal(mut self, enabled: bool) -> Self {
        self.compress_journal = enabled;
        self
    }

    /// Enables or disables journal recycling.
    pub fn recycle_journals(mut self, enabled: bool) -> Self {
        self.recycle_journals = enabled;
        self
    }

    /// Sets the background flush interval; `None` keeps flushing manual.
    pub fn flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Validates option ranges.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(VesperError::Invalid("page size must be a power of two"));
        }
        if !(512..=65536).contains(&self.page_size) {
            return Err(VesperError::Invalid("page size out of range"));
        }
        if self.max_journal_file_size < u64::from(self.page_size) {
            return Err(VesperError::Invalid("journal file size below one page"));
        }
        if self.max_scratch_file_size < u64::from(self.page_size) {
            return Err(VesperError::Invalid("scratch file size below one page"));
        }
        Ok(())
    }

    /// Merges overrides from `vesper.toml` in the environment directory.
    ///
    /// Absent file or absent fields leave the current values untouched.
    pub fn apply_file_overrides(&mut self, dir: &Path) -> Result<()> {
        let path = dir.join(OPTIONS_FILE_NAME);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(VesperError::from(err)),
        };
        let file: OptionsFile = toml::from_str(&text)
            .map_err(|err| VesperError::InvalidOwned(format!("options file: {err}")))?;
        if let Some(page_size) = file.page_size {
            self.page_size = page_size;
        }
        if let Some(bytes) = file.max_journal_file_size {
            self.max_journal_file_size = bytes;
        }
        if let Some(bytes) = file.max_scratch_file_size {
            self.max_scratch_file_size = bytes;
        }
        if let Some(durability) = file.durability {
            self.durability = durability;
        }
        if let Some(enabled) = file.compress_journal {
            self.compress_journal = enabled;
        }
        if let Some(enabled) = file.recycle_journals {
            self.recycle_journals = enabled;
        }
        if let Some(count) = file.max_recycled_journals {
            self.max_recycled_journals = count;
        }
        if let Some(ms) = file.flush_interval_ms {
            self.flush_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OptionsFile {
    page_size: Option<u32>,
    max_journal_file_size: Option<u64>,
    max_scratch_file_size: Option<u64>,
    durability: Option<Durability>,
    compress_journal: Option<bool>,
    recycle_journals: Option<bool>,
    max_recycled_journals: Option<usize>,
    flush_interval_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_validate() {
        assert!(EnvOptions::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_page_sizes() {
        assert!(EnvOptions::default().page_size(3000).validate().is_err());
        assert!(EnvOptions::default().page_size(256).validate().is_err());
        assert!(EnvOptions::default().page_size(1 << 17).validate().is_err());
    }

    #[test]
    fn file_overrides_merge_into_options() -> Result<()> {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(OPTIONS_FILE_NAME),
            "page_size = 4096\ndurability = \"lazy\"\nflush_interval_ms = 250\n",
        )
        .unwrap();
        let mut options = EnvOptions::default();
        options.apply_file_overrides(dir.path())?;
        assert_eq!(options.page_size, 4096);
        assert_eq!(options.durability, Durability::Lazy);
        assert_eq!(options.flush_interval, Some(Duration::from_millis(250)));
        assert!(options.compress_journal, "untouched fields keep defaults");
        Ok(())
    }

    #[test]
    fn unknown_options_are_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(OPTIONS_FILE_NAME), "nope = 1\n").unwrap();
        let mut options = EnvOptions::default();
        assert!(options.apply_file_overrides(dir.path()).is_err());
    }

    #[test]
    fn missing_file_is_fine() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut options = EnvOptions::default();
        options.apply_file_overrides(dir.path())?;
        assert_eq!(options.page_size, DEFAULT_PAGE_SIZE);
        Ok(())
    }
}
