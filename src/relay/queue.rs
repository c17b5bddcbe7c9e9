//! Serialized outbound delivery with rate-limit backoff.
//!
//! A single worker drains tasks strictly in FIFO order, so the platform
//! never sees overlapping or out-of-order sends from this process.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::relay::telegram::{Outbound, SendError};

/// Pause after every task, whatever its outcome. Throttles aggregate
/// throughput so bursts of replies don't trip flood control.
const COOLDOWN: Duration = Duration::from_millis(2100);

/// One outbound operation.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Text {
        chat_id: i64,
        text: String,
        reply_to: Option<i64>,
    },
    PhotoPath {
        chat_id: i64,
        path: PathBuf,
        reply_to: Option<i64>,
    },
    PhotoUrl {
        chat_id: i64,
        url: String,
        reply_to: Option<i64>,
    },
    Delete {
        chat_id: i64,
        message_id: i64,
    },
}

/// A queued delivery: the operation plus an optional temp file that is
/// removed after execution, success or not.
#[derive(Debug)]
pub struct DeliveryTask {
    pub op: Outgoing,
    pub cleanup_file: Option<PathBuf>,
}

impl DeliveryTask {
    pub fn new(op: Outgoing) -> Self {
        Self {
            op,
            cleanup_file: None,
        }
    }

    pub fn with_cleanup(op: Outgoing, cleanup_file: PathBuf) -> Self {
        Self {
            op,
            cleanup_file: Some(cleanup_file),
        }
    }
}

pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<DeliveryTask>,
    // Consumed by the first ensure_started call.
    rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryTask>>>,
    cooldown: Duration,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::with_cooldown(COOLDOWN)
    }

    pub fn with_cooldown(cooldown: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            cooldown,
        }
    }

    /// Start the single worker. Calling this more than once is a no-op.
    pub fn ensure_started(&self, outbound: Arc<dyn Outbound>) {
        let rx = self.rx.lock().unwrap().take();
        if let Some(rx) = rx {
            let cooldown = self.cooldown;
            tokio::spawn(worker(rx, outbound, cooldown));
        }
    }

    /// Place a task at the tail of the queue.
    pub fn enqueue(&self, task: DeliveryTask) {
        if self.tx.send(task).is_err() {
            warn!("Delivery queue closed, dropping task");
        }
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<DeliveryTask>,
    outbound: Arc<dyn Outbound>,
    cooldown: Duration,
) {
    info!("Delivery worker started");
    while let Some(task) = rx.recv().await {
        match execute(&*outbound, &task.op).await {
            Ok(()) => {}
            Err(SendError::RateLimited(secs)) => {
                outbound
                    .notify_operator(&format!("Rate limited: sleeping {secs}s"))
                    .await;
                sleep(Duration::from_secs(secs + 1)).await;
                // One retry; whatever happens now is final.
                if let Err(e) = execute(&*outbound, &task.op).await {
                    outbound
                        .notify_operator(&format!("Delivery failed after retry: {e}"))
                        .await;
                }
            }
            Err(e) => {
                outbound
                    .notify_operator(&format!("Delivery failed: {e}"))
                    .await;
            }
        }

        if let Some(ref path) = task.cleanup_file
            && path.exists()
            && let Err(e) = std::fs::remove_file(path)
        {
            warn!("Failed to remove temp file {:?}: {e}", path);
        }

        sleep(cooldown).await;
    }
}

async fn execute(outbound: &dyn Outbound, op: &Outgoing) -> Result<(), SendError> {
    match op {
        Outgoing::Text {
            chat_id,
            text,
            reply_to,
        } => outbound.send_text(*chat_id, text, *reply_to).await,
        Outgoing::PhotoPath {
            chat_id,
            path,
            reply_to,
        } => outbound.send_photo_path(*chat_id, path, *reply_to).await,
        Outgoing::PhotoUrl {
            chat_id,
            url,
            reply_to,
        } => outbound.send_photo_url(*chat_id, url, *reply_to).await,
        Outgoing::Delete {
            chat_id,
            message_id,
        } => outbound.delete_message(*chat_id, *message_id).await,
    }
}
