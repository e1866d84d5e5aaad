//! Room registry.
//!
//! Multiplexes transports onto rooms by URL path: rooms are created and
//! started on first access, shared across concurrent lookups, and, when
//! auto-clean is on, stopped and removed once their last client leaves.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::callback::{default_exception_handler, ExceptionHandler};
use crate::error::{Error, Result};
use crate::room::{Room, RoomConfig};
use crate::store::UpdateStore;
use crate::transport::Transport;

/// Builds the store for a newly created room from its name.
pub type StoreFactory = Arc<dyn Fn(&str) -> Arc<dyn UpdateStore> + Send + Sync>;

/// Server-level options applied to every room the registry creates.
pub struct RegistryOptions {
    /// Whether new rooms are ready to synchronize when opened.
    pub rooms_ready: bool,
    /// Delete a room when no client is connected anymore.
    pub auto_clean_rooms: bool,
    /// Restart a room's task scope after a handled error.
    pub auto_restart: bool,
    /// Shared exception handler for every room.
    pub exception_handler: Option<ExceptionHandler>,
    /// Optional per-room store binding.
    pub store_factory: Option<StoreFactory>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            rooms_ready: true,
            auto_clean_rooms: true,
            auto_restart: false,
            exception_handler: None,
            store_factory: None,
        }
    }
}

/// Owns every room in this process.
pub struct Registry {
    rooms_ready: bool,
    auto_clean_rooms: bool,
    auto_restart: bool,
    handler: ExceptionHandler,
    store_factory: Option<StoreFactory>,
    // one lock around the create-or-start path: concurrent get_room calls
    // for the same name must observe a single instance
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    started: watch::Sender<bool>,
}

impl Registry {
    pub fn new(options: RegistryOptions) -> Self {
        let (started, _) = watch::channel(false);
        Self {
            rooms_ready: options.rooms_ready,
            auto_clean_rooms: options.auto_clean_rooms,
            auto_restart: options.auto_restart,
            handler: options
                .exception_handler
                .unwrap_or_else(default_exception_handler),
            store_factory: options.store_factory,
            rooms: Mutex::new(HashMap::new()),
            started,
        }
    }

    pub fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    pub async fn start(&self) -> Result<()> {
        if self.is_started() {
            return Err(Error::AlreadyRunning("registry"));
        }
        self.started.send_replace(true);
        Ok(())
    }

    /// Stop the registry and every room it owns.
    pub async fn stop(&self) -> Result<()> {
        if !self.is_started() {
            return Err(Error::NotRunning("registry"));
        }
        self.started.send_replace(false);
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.drain().map(|(_, r)| r).collect();
        for room in rooms {
            let _ = room.stop().await;
        }
        Ok(())
    }

    /// Get the room with the given name, creating and starting it first
    /// if needed.
    pub async fn get_room(&self, name: &str) -> Result<Arc<Room>> {
        if !self.is_started() {
            return Err(Error::NotRunning("registry"));
        }
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(name) {
            return Ok(room.clone());
        }

        let config = RoomConfig {
            ready: self.rooms_ready,
            auto_restart: self.auto_restart,
            exception_handler: Some(self.handler.clone()),
            store: self.store_factory.as_ref().map(|factory| factory(name)),
            ..RoomConfig::default()
        };
        let room = Arc::new(Room::new(name, config));
        room.start().await?;
        debug!(room = name, "created room");
        rooms.insert(name.to_string(), room.clone());
        Ok(room)
    }

    pub async fn room_names(&self) -> Vec<String> {
        self.rooms.lock().await.keys().cloned().collect()
    }

    /// Serve one client on the room named by its transport path.
    pub async fn serve(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let name = transport.path().to_string();
        let room = self.get_room(&name).await?;
        let result = room.serve(transport).await;
        if let Err(e) = result {
            if !(self.handler)(&e) {
                return Err(e);
            }
        }

        if self.auto_clean_rooms {
            // re-check emptiness under the registry lock so a client
            // connecting right now either finds the room or recreates it
            let mut rooms = self.rooms.lock().await;
            let still_empty = match rooms.get(&name) {
                Some(room) => room.client_count().await == 0,
                None => false,
            };
            if still_empty {
                if let Some(room) = rooms.remove(&name) {
                    drop(rooms);
                    debug!(room = %name, "removing empty room");
                    room.stop().await?;
                }
            }
        }
        Ok(())
    }

    /// Rename a room, keeping its state and clients.
    pub async fn rename_room(&self, from: &str, to: &str) -> Result<()> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .remove(from)
            .ok_or_else(|| Error::RoomNotFound(from.to_string()))?;
        rooms.insert(to.to_string(), room);
        Ok(())
    }

    /// Stop a room and drop it from the registry.
    pub async fn delete_room(&self, name: &str) -> Result<()> {
        let room = self
            .rooms
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| Error::RoomNotFound(name.to_string()))?;
        room.stop().await
    }
}
