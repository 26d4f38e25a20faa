use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The durable store cannot be used. Fatal to offline capability;
    /// direct online calls remain possible for the rest of the application.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] herd_store::Error),

    /// An immediate sync was requested while the connectivity monitor
    /// reports offline.
    #[error("cannot sync while offline")]
    Offline,

    /// The pending-operations collection reached its configured cap.
    #[error("sync queue is full ({0} operations)")]
    QueueFull(usize),

    /// The engine was assembled with an incomplete configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
