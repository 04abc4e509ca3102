use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown thread: {0}")]
    UnknownThread(String),

    #[error("unknown run: {0}")]
    UnknownRun(String),

    #[error("reservation for thread {0} has no remaining slots")]
    ReservationExhausted(String),
}
