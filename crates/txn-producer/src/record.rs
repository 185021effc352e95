//! Record construction.
//!
//! Keys carry the producer id and the offset the record is expected to land
//! at, formatted as `{producer:06}.{sequence:018}`. Records written inside a
//! transaction that is going to be aborted get the [`ABORTED_KEY_PREFIX`], so
//! a consumer that ever reads one reports an invalid read.

use crate::client::ProduceRecord;

pub const ABORTED_KEY_PREFIX: &str = "ABORTED MSG: ";

/// Producer id written into every key. Reserved for running several
/// producers against one topic.
pub const PRODUCER_ID: u32 = 0;

pub fn format_key(producer_id: u32, sequence: i64, aborted: bool) -> Vec<u8> {
    let key = format!("{producer_id:06}.{sequence:018}");
    if aborted {
        format!("{ABORTED_KEY_PREFIX}{key}").into_bytes()
    } else {
        key.into_bytes()
    }
}

/// What a consumer can learn from a record key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Written in a transaction expected to commit.
    Committed { producer_id: u32, sequence: i64 },
    /// Written in a transaction expected to abort; reading it is a bug.
    Aborted { producer_id: u32, sequence: i64 },
    Malformed,
}

pub fn classify_key(key: &[u8]) -> KeyKind {
    let Ok(key) = std::str::from_utf8(key) else {
        return KeyKind::Malformed;
    };
    let (aborted, body) = match key.strip_prefix(ABORTED_KEY_PREFIX) {
        Some(body) => (true, body),
        None => (false, key),
    };
    let Some((producer, sequence)) = body.split_once('.') else {
        return KeyKind::Malformed;
    };
    match (producer.parse::<u32>(), sequence.parse::<i64>()) {
        (Ok(producer_id), Ok(sequence)) if aborted => KeyKind::Aborted {
            producer_id,
            sequence,
        },
        (Ok(producer_id), Ok(sequence)) => KeyKind::Committed {
            producer_id,
            sequence,
        },
        _ => KeyKind::Malformed,
    }
}

/// Builds records and owns the synthetic timestamp cursor.
///
/// The cursor lives as long as the worker, so timestamps keep increasing
/// across epochs.
#[derive(Debug, Clone)]
pub struct RecordFactory {
    message_size: usize,
    fake_timestamp_ms: Option<i64>,
}

impl RecordFactory {
    pub fn new(message_size: usize, fake_timestamp_ms: Option<i64>) -> Self {
        Self {
            message_size,
            fake_timestamp_ms,
        }
    }

    pub fn build(
        &mut self,
        producer_id: u32,
        sequence: i64,
        partition: i32,
        aborted: bool,
    ) -> ProduceRecord {
        let timestamp_ms = self.fake_timestamp_ms.map(|ts| {
            self.fake_timestamp_ms = Some(ts + 1);
            ts
        });

        ProduceRecord {
            partition,
            key: format_key(producer_id, sequence, aborted),
            payload: vec![0u8; self.message_size],
            timestamp_ms,
        }
    }

    /// Timestamp the next record will carry, if synthetic timestamps are on.
    pub fn next_timestamp_ms(&self) -> Option<i64> {
        self.fake_timestamp_ms
    }
}
