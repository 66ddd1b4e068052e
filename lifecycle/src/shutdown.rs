//! Shutdown coordination.
//!
//! The graceful path latches a request, wakes waiters, and runs registered
//! handlers. The emergency path additionally arms a watchdog that delivers
//! SIGKILL once the wall-clock budget is spent; it must not be blockable by
//! a misbehaving handler.

use async_trait::async_trait;
use fabric_contracts::Service;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

type SyncHandler = Arc<dyn Fn() + Send + Sync>;
type AsyncHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct ShutdownState {
    requested: bool,
    reason: Option<String>,
    emergency: bool,
}

/// Service coordinating graceful and emergency shutdown.
pub struct ShutdownService {
    state: Mutex<ShutdownState>,
    notify: Notify,
    sync_handlers: Mutex<Vec<SyncHandler>>,
    async_handlers: Mutex<Vec<AsyncHandler>>,
    running: AtomicBool,
}

impl Default for ShutdownService {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ShutdownState::default()),
            notify: Notify::new(),
            sync_handlers: Mutex::new(Vec::new()),
            async_handlers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Request system shutdown. The first call latches the reason, wakes
    /// waiters, and runs sync handlers; duplicates are absorbed.
    pub fn request_shutdown(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.requested {
                debug!("Shutdown already requested, ignoring duplicate: {}", reason);
                return;
            }
            state.requested = true;
            state.reason = Some(reason.to_string());
        }

        error!("SYSTEM SHUTDOWN REQUESTED: {}", reason);
        self.notify.notify_waiters();
        self.execute_sync_handlers();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.state.lock().requested
    }

    pub fn shutdown_reason(&self) -> Option<String> {
        self.state.lock().reason.clone()
    }

    pub fn is_emergency(&self) -> bool {
        self.state.lock().emergency
    }

    pub fn register_shutdown_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.sync_handlers.lock().push(Arc::new(handler));
    }

    pub fn register_async_shutdown_handler(
        &self,
        handler: impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) {
        self.async_handlers.lock().push(Arc::new(handler));
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_shutdown_requested() {
                return;
            }
            notified.await;
        }
    }

    fn execute_sync_handlers(&self) {
        // Snapshot first: handlers may themselves touch this service.
        let handlers: Vec<SyncHandler> = self.sync_handlers.lock().clone();
        for (i, handler) in handlers.into_iter().enumerate() {
            handler();
            debug!("Executed shutdown handler #{}", i);
        }
    }

    /// Run registered async handlers in order. Invoked by the owning
    /// coordinator during teardown.
    pub async fn execute_async_handlers(&self) {
        let handlers: Vec<AsyncHandler> = self.async_handlers.lock().clone();
        for (i, handler) in handlers.into_iter().enumerate() {
            handler().await;
            debug!("Executed async shutdown handler #{}", i);
        }
    }

    /// Execute emergency shutdown without negotiation.
    ///
    /// Latches emergency flags, runs sync handlers immediately, gives async
    /// handlers half the budget, and arms a watchdog that SIGKILLs the
    /// process when the full budget elapses. The caller's main loop observes
    /// the emergency flag and exits with code 1.
    pub async fn emergency_shutdown(&self, reason: &str, timeout: Duration) {
        error!("EMERGENCY SHUTDOWN: {}", reason);

        {
            let mut state = self.state.lock();
            state.requested = true;
            state.reason = Some(format!("EMERGENCY: {}", reason));
            state.emergency = true;
        }
        self.notify.notify_waiters();

        self.execute_sync_handlers();

        match tokio::time::timeout(timeout / 2, self.execute_async_handlers()).await {
            Ok(()) => {}
            Err(_) => warn!("Emergency shutdown handlers timed out"),
        }

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            error!("Emergency shutdown timeout reached - forcing termination");
            force_kill();
        });

        info!("Emergency handlers complete; awaiting process exit");
    }
}

#[cfg(unix)]
fn force_kill() {
    // SAFETY: sends SIGKILL to our own pid; never returns on success.
    unsafe {
        libc::kill(libc::getpid(), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn force_kill() {
    std::process::exit(1);
}

#[async_trait]
impl Service for ShutdownService {
    fn name(&self) -> &str {
        "ShutdownService"
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("ShutdownService started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        info!("ShutdownService stopped");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
