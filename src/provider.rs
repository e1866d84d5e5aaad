//! Client-side provider: the mirror image of a room's serve loop.
//!
//! A provider keeps a local document synchronized with a remote room over
//! a transport. It forwards every locally observed update through a
//! bounded outbound channel, answers the server's sync messages, and
//! optionally feeds awareness frames into a local [`Awareness`].

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use yrs::Doc;

use crate::awareness::{Awareness, Origin};
use crate::error::{Error, Result};
use crate::protocol::{self, MessageType};
use crate::room::{Lifecycle, UPDATE_CHANNEL_CAPACITY};
use crate::transport::Transport;

/// Connects a local document to a remote room.
pub struct Provider {
    doc: Doc,
    transport: Arc<dyn Transport>,
    awareness: Option<Arc<Awareness>>,
    channel_capacity: usize,
    lifecycle: watch::Sender<Lifecycle>,
    cancel: StdMutex<Option<CancellationToken>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    doc_subscription: StdMutex<Option<yrs::Subscription>>,
}

impl Provider {
    pub fn new(doc: Doc, transport: Arc<dyn Transport>) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Created);
        Self {
            doc,
            transport,
            awareness: None,
            channel_capacity: UPDATE_CHANNEL_CAPACITY,
            lifecycle,
            cancel: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
            doc_subscription: StdMutex::new(None),
        }
    }

    /// Route inbound awareness frames into this local awareness instead
    /// of dropping them.
    pub fn with_awareness(mut self, awareness: Arc<Awareness>) -> Self {
        self.awareness = Some(awareness);
        self
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Subscribe to the local document and run the sync loop.
    pub async fn start(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Created => {}
            Lifecycle::Stopping | Lifecycle::Stopped => {
                return Err(Error::NotRunning("provider"))
            }
            _ => return Err(Error::AlreadyRunning("provider")),
        }
        self.lifecycle.send_replace(Lifecycle::Starting);

        let (update_tx, update_rx) = mpsc::channel::<Vec<u8>>(self.channel_capacity);
        let subscription = self
            .doc
            .observe_update_v1(move |_txn, event| {
                // losing an update here only affects this peer; the next
                // sync handshake repairs it
                let _ = update_tx.try_send(event.update.clone());
            })
            .map_err(|_| Error::Crdt("failed to attach document observer".into()))?;
        *self.doc_subscription.lock().unwrap() = Some(subscription);

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(token.clone());

        let sender = tokio::spawn(run_sender(
            update_rx,
            self.transport.clone(),
            token.clone(),
        ));
        let receiver = tokio::spawn(run_receiver(
            self.doc.clone(),
            self.transport.clone(),
            self.awareness.clone(),
            token,
        ));
        *self.tasks.lock().unwrap() = vec![sender, receiver];

        self.lifecycle.send_replace(Lifecycle::Running);
        Ok(())
    }

    /// Cancel the provider's tasks and detach the document observer.
    pub async fn stop(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Created => return Err(Error::NotRunning("provider")),
            Lifecycle::Stopped => return Ok(()),
            _ => {}
        }
        self.lifecycle.send_replace(Lifecycle::Stopping);
        if let Some(token) = self.cancel.lock().unwrap().take() {
            token.cancel();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        *self.doc_subscription.lock().unwrap() = None;
        self.lifecycle.send_replace(Lifecycle::Stopped);
        Ok(())
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        if let Some(token) = self.cancel.lock().unwrap().take() {
            token.cancel();
        }
    }
}

/// Drain the outbound channel into the transport. Send failures are
/// logged and dropped: losing an update here only affects this peer.
async fn run_sender(
    mut update_rx: mpsc::Receiver<Vec<u8>>,
    transport: Arc<dyn Transport>,
    token: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = token.cancelled() => return,
            update = update_rx.recv() => match update {
                Some(update) => update,
                None => return,
            },
        };
        let frame = protocol::create_update(&update);
        if let Err(e) = transport.send(frame).await {
            debug!(error = %e, "dropping outbound update");
        }
    }
}

/// Send the opening handshake, then answer inbound frames.
async fn run_receiver(
    doc: Doc,
    transport: Arc<dyn Transport>,
    awareness: Option<Arc<Awareness>>,
    token: CancellationToken,
) {
    let step1 = protocol::create_sync_step1(&protocol::encode_state_vector(&doc));
    if transport.send(step1).await.is_err() {
        return;
    }

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return,
            frame = transport.recv() => match frame {
                Ok(frame) => frame,
                Err(_) => return,
            },
        };

        match frame.first().copied() {
            Some(t) if t == MessageType::Sync as u8 => {
                match protocol::handle_sync(&frame[1..], &doc) {
                    Ok(Some(reply)) => {
                        if transport.send(reply).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "dropping bad sync frame"),
                }
            }
            Some(t) if t == MessageType::Awareness as u8 => {
                if let Some(awareness) = &awareness {
                    let mut payload = &frame[1..];
                    match protocol::read_var_bytes(&mut payload) {
                        Ok(update) => {
                            if let Err(e) = awareness.apply_update(update, Origin::Remote) {
                                warn!(error = %e, "dropping bad awareness update");
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping bad awareness frame"),
                    }
                }
            }
            _ => debug!("ignoring unknown frame"),
        }
    }
}
