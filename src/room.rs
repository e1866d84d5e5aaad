//! Document rooms.
//!
//! A room owns one CRDT document, the set of connected clients, a bounded
//! fan-out channel for outbound updates, and an optional store binding.
//! Every update observed on the document is framed once and broadcast to
//! all clients while being appended to the store. A supervisor task owns
//! the room's task scope; with `auto_restart` it re-enters a fresh scope
//! after an error the exception handler marked handled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::join_all;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use yrs::Doc;

use crate::awareness::{Awareness, AwarenessSubscription, Origin};
use crate::callback::{default_exception_handler, ExceptionHandler, MessageFilter};
use crate::error::{Error, Result};
use crate::protocol::{self, MessageType};
use crate::store::UpdateStore;
use crate::transport::Transport;

/// Default capacity of the bounded update fan-out channel.
pub const UPDATE_CHANNEL_CAPACITY: usize = 65_536;

/// Room (and provider) lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Construction options for a [`Room`].
pub struct RoomConfig {
    /// Whether the document is ready to synchronize immediately. When
    /// false, client handshakes are deferred until [`Room::mark_ready`],
    /// so an external loader can populate the document first.
    pub ready: bool,
    /// Re-enter a fresh task scope after a handled error.
    pub auto_restart: bool,
    /// Decides whether an error raised in the room's scope was handled.
    pub exception_handler: Option<ExceptionHandler>,
    /// Durable append log for every observed update.
    pub store: Option<Arc<dyn UpdateStore>>,
    /// Capacity of the update fan-out channel.
    pub update_channel_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            ready: true,
            auto_restart: false,
            exception_handler: None,
            store: None,
            update_channel_capacity: UPDATE_CHANNEL_CAPACITY,
        }
    }
}

type ClientMap = Arc<RwLock<HashMap<String, Arc<dyn Transport>>>>;
type SubscriptionSlot = Arc<StdMutex<Option<yrs::Subscription>>>;

/// One document plus its connected clients and optional persistence.
pub struct Room {
    name: String,
    doc: Doc,
    awareness: Arc<Awareness>,
    clients: ClientMap,
    store: Option<Arc<dyn UpdateStore>>,
    handler: ExceptionHandler,
    auto_restart: bool,
    channel_capacity: usize,
    ready: watch::Sender<bool>,
    lifecycle: watch::Sender<Lifecycle>,
    on_message: RwLock<Option<MessageFilter>>,
    cancel: StdMutex<Option<CancellationToken>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    doc_subscription: SubscriptionSlot,
    epoch: Arc<AtomicU64>,
    _awareness_subscription: AwarenessSubscription,
}

impl Room {
    pub fn new(name: impl Into<String>, config: RoomConfig) -> Self {
        let name = name.into();
        let doc = Doc::new();
        let awareness = Arc::new(Awareness::new(u64::from(doc.client_id())));
        let clients: ClientMap = Arc::new(RwLock::new(HashMap::new()));
        let (ready, _) = watch::channel(config.ready);
        let (lifecycle, _) = watch::channel(Lifecycle::Created);
        let handler = config
            .exception_handler
            .unwrap_or_else(default_exception_handler);

        // Local awareness changes fan out to every client. Remote frames
        // are rebroadcast in `serve` and never re-enter through here.
        let awareness_subscription = {
            let weak = Arc::downgrade(&awareness);
            let clients = clients.clone();
            let room_name = name.clone();
            awareness.observe(move |change, origin| {
                if origin != Origin::Local || change.is_empty() {
                    return;
                }
                let Some(awareness) = weak.upgrade() else {
                    return;
                };
                match awareness.encode_update(&change.changed_clients()) {
                    Ok(update) => {
                        let frame = protocol::create_awareness(&update);
                        let clients = clients.clone();
                        tokio::spawn(async move {
                            broadcast_frame(&clients, frame).await;
                        });
                    }
                    Err(e) => warn!(room = %room_name, error = %e, "failed to encode awareness"),
                }
            })
        };

        Self {
            name,
            doc,
            awareness,
            clients,
            store: config.store,
            handler,
            auto_restart: config.auto_restart,
            channel_capacity: config.update_channel_capacity,
            ready,
            lifecycle,
            on_message: RwLock::new(None),
            cancel: StdMutex::new(None),
            supervisor: StdMutex::new(None),
            doc_subscription: Arc::new(StdMutex::new(None)),
            epoch: Arc::new(AtomicU64::new(0)),
            _awareness_subscription: awareness_subscription,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The room's document. External code may populate it before marking
    /// the room ready; once clients are connected, only inbound sync
    /// messages should mutate it.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.awareness
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Allow deferred client handshakes to proceed.
    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    /// How many task-scope generations have run; increments on restart.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Install (or clear) the inbound frame filter. The filter may be
    /// sync or async; returning `true` drops the frame.
    pub async fn set_on_message(&self, filter: Option<MessageFilter>) {
        *self.on_message.write().await = filter;
    }

    /// Transition Created → Starting → Running, spawning the room's
    /// task scope: a waiter that attaches the document observer once the
    /// room is ready, and the fan-out task.
    pub async fn start(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Created => {}
            Lifecycle::Stopping | Lifecycle::Stopped => return Err(Error::NotRunning("room")),
            _ => return Err(Error::AlreadyRunning("room")),
        }
        self.lifecycle.send_replace(Lifecycle::Starting);

        if let Some(store) = &self.store {
            if !store.is_started() {
                store.start().await?;
            }
        }

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(token.clone());

        let ctx = SupervisorCtx {
            name: self.name.clone(),
            doc: self.doc.clone(),
            clients: self.clients.clone(),
            store: self.store.clone(),
            handler: self.handler.clone(),
            auto_restart: self.auto_restart,
            channel_capacity: self.channel_capacity,
            ready: self.ready.subscribe(),
            lifecycle: self.lifecycle.clone(),
            doc_subscription: self.doc_subscription.clone(),
            epoch: self.epoch.clone(),
        };
        let handle = tokio::spawn(supervise(ctx, token));
        *self.supervisor.lock().unwrap() = Some(handle);

        let mut lifecycle = self.lifecycle.subscribe();
        lifecycle
            .wait_for(|l| matches!(l, Lifecycle::Running | Lifecycle::Stopped))
            .await
            .map_err(|_| Error::NotRunning("room"))?;
        Ok(())
    }

    /// Stop the room: detach the document observer, drain pending updates
    /// to the store, and cancel the task scope. Idempotent once stopped;
    /// errors if the room was never started.
    pub async fn stop(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Created => return Err(Error::NotRunning("room")),
            Lifecycle::Stopped => return Ok(()),
            _ => {}
        }
        if let Some(token) = self.cancel.lock().unwrap().take() {
            token.cancel();
        }
        let handle = self.supervisor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let mut lifecycle = self.lifecycle.subscribe();
        let _ = lifecycle.wait_for(|l| *l == Lifecycle::Stopped).await;
        Ok(())
    }

    /// Serve one client for the whole life of its connection.
    pub async fn serve(&self, transport: Arc<dyn Transport>) -> Result<()> {
        if matches!(
            self.lifecycle(),
            Lifecycle::Created | Lifecycle::Stopping | Lifecycle::Stopped
        ) {
            return Err(Error::NotRunning("room"));
        }

        // the handshake is deferred until an external loader (if any)
        // has populated the document
        let mut ready = self.ready.subscribe();
        if ready.wait_for(|r| *r).await.is_err() {
            return Err(Error::NotRunning("room"));
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.clients
            .write()
            .await
            .insert(id.clone(), transport.clone());
        let result = self.serve_client(&transport).await;
        self.clients.write().await.remove(&id);
        result
    }

    async fn serve_client(&self, transport: &Arc<dyn Transport>) -> Result<()> {
        let step1 = protocol::create_sync_step1(&protocol::encode_state_vector(&self.doc));
        if transport.send(step1).await.is_err() {
            return Ok(());
        }

        loop {
            let frame = match transport.recv().await {
                Ok(frame) => frame,
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => {
                    if (self.handler)(&e) {
                        return Ok(());
                    }
                    return Err(e);
                }
            };

            let filter = self.on_message.read().await.clone();
            if let Some(filter) = filter {
                if filter.call(frame.clone()).await {
                    continue;
                }
            }

            match frame.first().copied() {
                Some(t) if t == MessageType::Sync as u8 => {
                    match protocol::handle_sync(&frame[1..], &self.doc) {
                        Ok(Some(reply)) => {
                            if transport.send(reply).await.is_err() {
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(room = %self.name, error = %e, "dropping bad sync frame")
                        }
                    }
                }
                Some(t) if t == MessageType::Awareness as u8 => {
                    // every client gets the frame back, the sender included:
                    // clients treat echoed awareness as a keepalive
                    broadcast_frame(&self.clients, frame.clone()).await;
                    let mut payload = &frame[1..];
                    match protocol::read_var_bytes(&mut payload) {
                        Ok(update) => {
                            if let Err(e) = self.awareness.apply_update(update, Origin::Remote) {
                                warn!(room = %self.name, error = %e, "dropping bad awareness update");
                            }
                        }
                        Err(e) => {
                            warn!(room = %self.name, error = %e, "dropping bad awareness frame")
                        }
                    }
                }
                Some(other) => {
                    warn!(room = %self.name, message_type = other, "unknown message type")
                }
                None => warn!(room = %self.name, "empty frame"),
            }
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        if let Some(token) = self.cancel.lock().unwrap().take() {
            token.cancel();
        }
    }
}

/// Everything the supervisor task needs, detached from the room itself.
struct SupervisorCtx {
    name: String,
    doc: Doc,
    clients: ClientMap,
    store: Option<Arc<dyn UpdateStore>>,
    handler: ExceptionHandler,
    auto_restart: bool,
    channel_capacity: usize,
    ready: watch::Receiver<bool>,
    lifecycle: watch::Sender<Lifecycle>,
    doc_subscription: SubscriptionSlot,
    epoch: Arc<AtomicU64>,
}

/// The outer restart loop around the room's task scope.
async fn supervise(ctx: SupervisorCtx, token: CancellationToken) {
    loop {
        ctx.epoch.fetch_add(1, Ordering::SeqCst);

        let (update_tx, update_rx) = mpsc::channel::<Vec<u8>>(ctx.channel_capacity);
        let (err_tx, mut err_rx) = mpsc::channel::<Error>(1);

        // attach the doc observer before reporting Running when the room
        // is already ready; otherwise a waiter attaches it on mark_ready
        let waiter = if *ctx.ready.borrow() {
            attach_observer(&ctx.doc, update_tx, err_tx, &ctx.doc_subscription);
            None
        } else {
            Some(tokio::spawn(attach_when_ready(
                ctx.doc.clone(),
                ctx.ready.clone(),
                update_tx,
                err_tx,
                ctx.doc_subscription.clone(),
                token.clone(),
            )))
        };
        let mut fan_out = tokio::spawn(run_fan_out(
            ctx.name.clone(),
            update_rx,
            ctx.clients.clone(),
            ctx.store.clone(),
            ctx.handler.clone(),
            token.clone(),
        ));

        // only report Running once the observer is in place, so updates
        // applied right after start() cannot slip past the fan-out
        ctx.lifecycle.send_replace(Lifecycle::Running);

        enum Outcome {
            Stop,
            Fatal(Error),
            Unhandled(Error),
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => Outcome::Stop,
            Some(e) = err_rx.recv() => Outcome::Fatal(e),
            res = &mut fan_out => match res {
                Ok(Ok(())) => Outcome::Stop,
                Ok(Err(e)) => Outcome::Unhandled(e),
                Err(join_err) => Outcome::Fatal(Error::Callback(join_err.to_string())),
            },
        };

        match outcome {
            Outcome::Stop => {
                ctx.lifecycle.send_replace(Lifecycle::Stopping);
                if let Some(waiter) = &waiter {
                    waiter.abort();
                }
                // detaching the observer drops the channel sender; the
                // fan-out drains what is buffered, so every observed
                // update reaches the store before we report Stopped
                *ctx.doc_subscription.lock().unwrap() = None;
                if !fan_out.is_finished() {
                    if let Ok(Err(e)) = (&mut fan_out).await {
                        debug!(room = %ctx.name, error = %e, "fan-out error during shutdown");
                    }
                }
                ctx.lifecycle.send_replace(Lifecycle::Stopped);
                return;
            }
            Outcome::Fatal(e) => {
                if let Some(waiter) = &waiter {
                    waiter.abort();
                }
                fan_out.abort();
                *ctx.doc_subscription.lock().unwrap() = None;
                let handled = (ctx.handler)(&e);
                if handled && ctx.auto_restart {
                    warn!(room = %ctx.name, error = %e, "restarting room after handled error");
                    ctx.lifecycle.send_replace(Lifecycle::Starting);
                    continue;
                }
                if !handled {
                    error!(room = %ctx.name, error = %e, "unhandled room error");
                }
                ctx.lifecycle.send_replace(Lifecycle::Stopped);
                return;
            }
            Outcome::Unhandled(e) => {
                // the fan-out already offered this error to the handler
                if let Some(waiter) = &waiter {
                    waiter.abort();
                }
                *ctx.doc_subscription.lock().unwrap() = None;
                error!(room = %ctx.name, error = %e, "unhandled room error");
                ctx.lifecycle.send_replace(Lifecycle::Stopped);
                return;
            }
        }
    }
}

/// Wait for the room to become ready, then attach the document observer
/// that feeds the fan-out channel.
async fn attach_when_ready(
    doc: Doc,
    mut ready: watch::Receiver<bool>,
    update_tx: mpsc::Sender<Vec<u8>>,
    err_tx: mpsc::Sender<Error>,
    slot: SubscriptionSlot,
    token: CancellationToken,
) {
    tokio::select! {
        _ = token.cancelled() => return,
        res = ready.wait_for(|r| *r) => {
            if res.is_err() {
                return;
            }
        }
    }
    attach_observer(&doc, update_tx, err_tx, &slot);
}

/// Subscribe to document updates, feeding them to the fan-out channel.
fn attach_observer(
    doc: &Doc,
    update_tx: mpsc::Sender<Vec<u8>>,
    err_tx: mpsc::Sender<Error>,
    slot: &SubscriptionSlot,
) {
    let overflow_tx = err_tx.clone();
    let subscription = doc.observe_update_v1(move |_txn, event| {
        // losing an update here would silently desynchronize replicas,
        // so a full channel is fatal rather than lossy
        if update_tx.try_send(event.update.clone()).is_err() {
            let _ = overflow_tx.try_send(Error::ChannelOverflow);
        }
    });
    match subscription {
        Ok(sub) => {
            *slot.lock().unwrap() = Some(sub);
        }
        Err(_) => {
            let _ = err_tx.try_send(Error::Crdt("failed to attach document observer".into()));
        }
    }
}

/// Drain the update channel: frame each update once, broadcast it to all
/// clients concurrently, and append it to the store.
async fn run_fan_out(
    room: String,
    mut update_rx: mpsc::Receiver<Vec<u8>>,
    clients: ClientMap,
    store: Option<Arc<dyn UpdateStore>>,
    handler: ExceptionHandler,
    token: CancellationToken,
) -> Result<()> {
    if let Some(store) = &store {
        // the drain loop below is deliberately not cancellable, so that a
        // stopping room still flushes buffered updates; only this gate is.
        // biased: a started store must win over a cancelled token, or a
        // quick start-write-stop sequence could skip the flush
        tokio::select! {
            biased;
            _ = store.wait_started() => {}
            _ = token.cancelled() => return Ok(()),
        }
    }
    while let Some(update) = update_rx.recv().await {
        debug!(room = %room, bytes = update.len(), "fanning out update");
        let frame = protocol::create_update(&update);
        match &store {
            Some(store) => {
                let (_, write) = tokio::join!(
                    broadcast_frame(&clients, frame),
                    store.write(&update)
                );
                if let Err(e) = write {
                    warn!(room = %room, error = %e, "store write failed");
                    if !handler(&e) {
                        return Err(e);
                    }
                }
            }
            None => broadcast_frame(&clients, frame).await,
        }
    }
    Ok(())
}

/// Send one frame to every connected client concurrently. Clients whose
/// transport reports closed are removed; other send failures are logged.
async fn broadcast_frame(clients: &ClientMap, frame: Vec<u8>) {
    let snapshot: Vec<(String, Arc<dyn Transport>)> = clients
        .read()
        .await
        .iter()
        .map(|(id, transport)| (id.clone(), transport.clone()))
        .collect();
    if snapshot.is_empty() {
        return;
    }

    let sends = snapshot.into_iter().map(|(id, transport)| {
        let frame = frame.clone();
        async move { (id, transport.send(frame).await) }
    });
    let mut closed = Vec::new();
    for (id, result) in join_all(sends).await {
        match result {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => closed.push(id),
            Err(e) => warn!(error = %e, "failed to send to client"),
        }
    }
    if !closed.is_empty() {
        let mut map = clients.write().await;
        for id in closed {
            map.remove(&id);
        }
    }
}
