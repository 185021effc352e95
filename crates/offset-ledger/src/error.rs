use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Partition {partition} out of range (topic has {partitions} partitions)")]
    PartitionOutOfRange { partition: i32, partitions: usize },

    #[error("Ledger file belongs to topic '{found}', expected '{expected}'")]
    TopicMismatch { expected: String, found: String },
}

pub type Result<T> = std::result::Result<T, Error>;
