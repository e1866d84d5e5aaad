//! A collaborative-editing relay for Yjs documents.
//!
//! Documents live in named rooms; each room synchronizes one CRDT
//! replica with any number of WebSocket clients and appends every update
//! to an optional durable store. The [`registry::Registry`] multiplexes
//! connections over rooms by URL path, [`provider::Provider`] is the
//! same protocol driven from the client side, and [`store`] holds the
//! file-per-document and shared-SQLite append logs.

pub mod api;
pub mod awareness;
pub mod callback;
pub mod error;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod room;
pub mod store;
pub mod transport;

pub use awareness::{Awareness, AwarenessChange, Origin};
pub use callback::{
    default_exception_handler, exception_logger, Callback, ExceptionHandler, MessageFilter,
    MetadataCallback,
};
pub use error::{Error, Result};
pub use provider::Provider;
pub use registry::{Registry, RegistryOptions, StoreFactory};
pub use room::{Lifecycle, Room, RoomConfig, UPDATE_CHANNEL_CAPACITY};
pub use store::{FileStore, SqliteStore, StoredUpdate, UpdateStore};
pub use transport::{AxumWebSocket, Transport};
