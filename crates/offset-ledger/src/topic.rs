//! Filesystem-backed ledger of verified offsets for every partition of a topic.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::ranges::OffsetRanges;

/// On-disk representation of a [`TopicOffsetRanges`].
///
/// # File Format
///
/// ```json
/// {
///     "topic": "verifier",
///     "partition_ranges": [
///         { "ranges": [ { "lower": 1, "upper": 26 }, { "lower": 28, "upper": 40 } ] },
///         { "ranges": [] }
///     ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredOffsetRanges {
    pub topic: String,
    pub partition_ranges: Vec<OffsetRanges>,
}

/// Valid offsets for each partition of one topic.
///
/// Each partition is guarded by its own lock, so inserts on different
/// partitions never contend. The writer (a producer) inserts offsets as they
/// are acknowledged and calls [`store`](Self::store) periodically; a consumer
/// side validator loads the persisted file to decide which reads are legal.
#[derive(Debug)]
pub struct TopicOffsetRanges {
    topic: String,
    path: PathBuf,
    partitions: Vec<Mutex<OffsetRanges>>,
}

impl TopicOffsetRanges {
    /// Name of the ledger file for `topic` inside a ledger directory.
    pub fn file_name(topic: &str) -> String {
        format!("valid_offsets_{topic}.json")
    }

    /// Create an empty ledger that will persist into `dir`.
    pub fn new(dir: impl AsRef<Path>, topic: &str, partitions: usize) -> Self {
        Self {
            topic: topic.to_string(),
            path: dir.as_ref().join(Self::file_name(topic)),
            partitions: (0..partitions)
                .map(|_| Mutex::new(OffsetRanges::new()))
                .collect(),
        }
    }

    /// Load a previously stored ledger, or start empty if none exists.
    ///
    /// If the stored file covers fewer partitions than requested, the missing
    /// partitions start empty; extra stored partitions are kept.
    pub fn load(dir: impl AsRef<Path>, topic: &str, partitions: usize) -> Result<Self> {
        let mut ledger = Self::new(dir, topic, partitions);

        if !ledger.path.exists() {
            tracing::info!(
                "No offset ledger at {}, starting empty",
                ledger.path.display()
            );
            return Ok(ledger);
        }

        let content = std::fs::read_to_string(&ledger.path)?;
        let stored: StoredOffsetRanges = serde_json::from_str(&content)?;
        if stored.topic != topic {
            return Err(Error::TopicMismatch {
                expected: topic.to_string(),
                found: stored.topic,
            });
        }

        let count = stored.partition_ranges.len().max(partitions);
        let mut loaded: Vec<Mutex<OffsetRanges>> = stored
            .partition_ranges
            .into_iter()
            .map(Mutex::new)
            .collect();
        loaded.resize_with(count, || Mutex::new(OffsetRanges::new()));
        ledger.partitions = loaded;

        tracing::info!(
            "Loaded offset ledger for topic '{}' from {} ({} offsets)",
            topic,
            ledger.path.display(),
            ledger.total_offsets()
        );
        Ok(ledger)
    }

    /// Record that `offset` on `partition` was verified.
    pub fn insert(&self, partition: i32, offset: i64) -> Result<()> {
        self.lock(partition)?.insert(offset);
        Ok(())
    }

    pub fn contains(&self, partition: i32, offset: i64) -> bool {
        self.lock(partition)
            .map(|ranges| ranges.contains(offset))
            .unwrap_or(false)
    }

    /// Copy of the ranges currently recorded for `partition`.
    pub fn partition(&self, partition: i32) -> Result<OffsetRanges> {
        Ok(self.lock(partition)?.clone())
    }

    /// Total number of offsets recorded across all partitions.
    pub fn total_offsets(&self) -> u64 {
        self.partitions
            .iter()
            .map(|p| p.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Persist the ledger.
    ///
    /// The file is written to a temporary sibling and renamed into place, so
    /// a reader never observes a partially written ledger.
    pub fn store(&self) -> Result<()> {
        let stored = StoredOffsetRanges {
            topic: self.topic.clone(),
            partition_ranges: self
                .partitions
                .iter()
                .map(|p| p.lock().unwrap_or_else(PoisonError::into_inner).clone())
                .collect(),
        };
        let data = serde_json::to_vec(&stored)?;

        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Stored offset ledger to {}", self.path.display());
        Ok(())
    }

    fn lock(&self, partition: i32) -> Result<MutexGuard<'_, OffsetRanges>> {
        let slot = usize::try_from(partition)
            .ok()
            .and_then(|p| self.partitions.get(p))
            .ok_or(Error::PartitionOutOfRange {
                partition,
                partitions: self.partitions.len(),
            })?;
        Ok(slot.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
