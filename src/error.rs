//! Error types shared across the relay.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by rooms, stores, and the protocol engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer went away. Handled locally (the client is removed and the
    /// serve loop exits); never fatal to a room.
    #[error("transport closed")]
    TransportClosed,

    /// A frame could not be parsed. The frame is dropped and logged.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// The CRDT engine rejected an update or state vector.
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// A store has no records for the requested document path.
    #[error("no updates stored for this document")]
    DocumentNotFound,

    /// The room's bounded update channel filled up. Fatal: dropping an
    /// update would silently desynchronize replicas.
    #[error("update channel overflow")]
    ChannelOverflow,

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("no such room: {0}")]
    RoomNotFound(String),

    /// A store-level failure that is not an I/O or database error,
    /// e.g. a corrupted record framing.
    #[error("store error: {0}")]
    Store(String),

    /// A user-supplied callback failed.
    #[error("user callback error: {0}")]
    Callback(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether this error means the peer simply disconnected.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::TransportClosed)
    }
}
