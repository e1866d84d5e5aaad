//! Shared test fixtures: an in-memory transport pair and polling helpers.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use yrelay::error::{Error, Result};
use yrelay::transport::Transport;

/// One end of a bidirectional in-memory connection.
pub struct MemoryTransport {
    path: String,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

/// Two connected transports sharing `path`; dropping one end closes the
/// other end's receive side.
pub fn pair(path: &str) -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
    let (a_tx, b_rx) = mpsc::channel(256);
    let (b_tx, a_rx) = mpsc::channel(256);
    let a = Arc::new(MemoryTransport {
        path: path.to_string(),
        tx: a_tx,
        rx: Mutex::new(a_rx),
    });
    let b = Arc::new(MemoryTransport {
        path: path.to_string(),
        tx: b_tx,
        rx: Mutex::new(b_rx),
    });
    (a, b)
}

#[async_trait]
impl Transport for MemoryTransport {
    fn path(&self) -> &str {
        &self.path
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.tx.send(data).await.map_err(|_| Error::TransportClosed)
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::TransportClosed)
    }
}

/// Poll `cond` until it holds, panicking after five seconds.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met within timeout");
}

/// Receive the next frame with a deadline, for tests that expect traffic.
pub async fn recv_frame(transport: &MemoryTransport) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(5), transport.recv())
        .await
        .expect("no frame within timeout")
        .expect("transport closed")
}
