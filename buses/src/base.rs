//! Common queue, lifecycle, and dispatch scaffolding shared by all buses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fabric_contracts::ServiceType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

const QUEUE_CAPACITY: usize = 1000;

/// Base record for queued bus work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: uuid::Uuid,
    pub handler_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub payload: serde_json::Value,
}

impl BusMessage {
    pub fn new(handler_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            handler_name: handler_name.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            payload,
        }
    }
}

/// Errors from the queueing layer.
#[derive(Debug, thiserror::Error)]
pub enum BusQueueError {
    #[error("bus queue for {0} is full")]
    QueueFull(ServiceType),

    #[error("bus for {0} is not running")]
    NotRunning(ServiceType),
}

/// Counters exposed by every bus.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub service_type: ServiceType,
    pub running: bool,
    pub processed: u64,
    pub failed: u64,
}

/// Implemented by concrete buses to drain their queue.
#[async_trait]
pub trait MessageBus: Send + Sync {
    fn core(&self) -> &BusCore;

    async fn process_message(&self, message: BusMessage);
}

/// Queue plus worker lifecycle shared by every bus.
///
/// Synchronous call-through operations bypass the queue entirely; the queue
/// carries fire-and-forget work only.
pub struct BusCore {
    service_type: ServiceType,
    tx: mpsc::Sender<BusMessage>,
    rx: Mutex<Option<mpsc::Receiver<BusMessage>>>,
    shutdown: Arc<Notify>,
    running: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl BusCore {
    pub fn new(service_type: ServiceType) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            service_type,
            tx,
            rx: Mutex::new(Some(rx)),
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Enqueue a message for the worker. Fails fast when the queue is full.
    pub fn enqueue(&self, message: BusMessage) -> Result<(), BusQueueError> {
        if !self.is_running() {
            return Err(BusQueueError::NotRunning(self.service_type));
        }
        self.tx
            .try_send(message)
            .map_err(|_| BusQueueError::QueueFull(self.service_type))
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            service_type: self.service_type,
            running: self.is_running(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Start the worker task draining the queue into `process_message`.
    pub async fn start<B: MessageBus + 'static>(bus: Arc<B>) {
        let core = bus.core();
        if core.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut rx = match core.rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("{} bus worker already consumed its queue", core.service_type);
                return;
            }
        };
        let shutdown = Arc::clone(&core.shutdown);
        let service_type = core.service_type;
        let worker = Arc::clone(&bus);
        tokio::spawn(async move {
            info!("{} bus worker started", service_type);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    message = rx.recv() => match message {
                        Some(message) => {
                            worker.process_message(message).await;
                            worker.core().record_processed();
                        }
                        None => break,
                    },
                }
            }
            debug!("{} bus worker stopped", service_type);
        });
    }

    /// Stop the worker. Queued messages that were not drained are dropped.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
            info!("{} bus stopped", self.service_type);
        }
    }
}
