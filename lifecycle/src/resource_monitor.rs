//! Resource monitor: periodic usage sampling and the threshold-to-signal
//! pipeline.
//!
//! Samples process memory and CPU, disk usage at the database path, token
//! consumption windows, and the active-thought count, then walks the budget
//! and emits protective signals (throttle/defer/reject/shutdown) with
//! per-(resource, level) cooldowns.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fabric_contracts::{
    ResourceAction, ResourceBudget, ResourceLimit, ResourceSnapshot, Service, TokenLedger,
};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CPU_WINDOW: usize = 60;
const TOKEN_WINDOW: usize = 86_400;
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Async handler invoked with `(signal, resource)`.
pub type SignalHandler = Arc<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fan-out registry mapping signal name to handlers.
///
/// Handlers must not fail upward; they are infallible futures.
#[derive(Default)]
pub struct ResourceSignalBus {
    handlers: RwLock<HashMap<String, Vec<SignalHandler>>>,
}

impl ResourceSignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, signal: &str, handler: SignalHandler) {
        self.handlers.write().entry(signal.to_string()).or_default().push(handler);
    }

    pub async fn emit(&self, signal: &str, resource: &str) {
        let handlers: Vec<SignalHandler> =
            self.handlers.read().get(signal).cloned().unwrap_or_default();
        for handler in handlers {
            handler(signal.to_string(), resource.to_string()).await;
        }
    }
}

/// Monitors system resources and enforces the budget.
pub struct ResourceMonitor {
    budget: ResourceBudget,
    db: Option<SqlitePool>,
    db_path: PathBuf,
    snapshot: RwLock<ResourceSnapshot>,
    signal_bus: Arc<ResourceSignalBus>,
    token_history: Mutex<VecDeque<(DateTime<Utc>, u64)>>,
    cpu_history: Mutex<VecDeque<u64>>,
    last_action: Mutex<HashMap<String, DateTime<Utc>>>,
    system: tokio::sync::Mutex<sysinfo::System>,
    pid: Option<sysinfo::Pid>,
    running: AtomicBool,
}

impl ResourceMonitor {
    pub fn new(
        budget: ResourceBudget,
        db: Option<SqlitePool>,
        db_path: impl Into<PathBuf>,
        signal_bus: Arc<ResourceSignalBus>,
    ) -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            warn!("Could not resolve own pid; process sampling disabled");
        }
        Self {
            budget,
            db,
            db_path: db_path.into(),
            snapshot: RwLock::new(ResourceSnapshot::new()),
            signal_bus,
            token_history: Mutex::new(VecDeque::new()),
            cpu_history: Mutex::new(VecDeque::new()),
            last_action: Mutex::new(HashMap::new()),
            system: tokio::sync::Mutex::new(sysinfo::System::new()),
            pid,
            running: AtomicBool::new(false),
        }
    }

    pub fn signal_bus(&self) -> Arc<ResourceSignalBus> {
        Arc::clone(&self.signal_bus)
    }

    /// Current snapshot. Readers tolerate a single-step-stale view.
    pub fn snapshot(&self) -> ResourceSnapshot {
        self.snapshot.read().clone()
    }

    /// Spawn the 1 Hz sampling task.
    pub fn spawn(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!("Resource monitor sampling started");
            while monitor.running.load(Ordering::SeqCst) {
                monitor.tick().await;
                tokio::time::sleep(SAMPLE_INTERVAL).await;
            }
            debug!("Resource monitor sampling stopped");
        });
    }

    /// Run one sampling cycle: update the snapshot, then check limits.
    pub async fn tick(&self) {
        self.update_snapshot().await;
        self.check_limits().await;
    }

    async fn update_snapshot(&self) {
        let (memory_mb, cpu_percent) = self.sample_process().await;

        let cpu_average_1m = {
            let mut history = self.cpu_history.lock();
            history.push_back(cpu_percent);
            while history.len() > CPU_WINDOW {
                history.pop_front();
            }
            history.iter().sum::<u64>() / history.len().max(1) as u64
        };

        let (disk_free_mb, disk_used_mb) = self.sample_disk();

        let now = Utc::now();
        let (tokens_used_hour, tokens_used_day) = {
            let history = self.token_history.lock();
            let hour_ago = now - ChronoDuration::hours(1);
            let day_ago = now - ChronoDuration::days(1);
            let hour: u64 =
                history.iter().filter(|(ts, _)| *ts > hour_ago).map(|(_, t)| *t).sum();
            let day: u64 = history.iter().filter(|(ts, _)| *ts > day_ago).map(|(_, t)| *t).sum();
            (hour, day)
        };

        let thoughts_active = self.count_active_thoughts().await;

        let mut snapshot = self.snapshot.write();
        snapshot.memory_mb = memory_mb;
        snapshot.memory_percent = memory_mb * 100 / self.budget.memory_mb.limit.max(1);
        snapshot.cpu_percent = cpu_percent;
        snapshot.cpu_average_1m = cpu_average_1m;
        snapshot.disk_free_mb = disk_free_mb;
        snapshot.disk_used_mb = disk_used_mb;
        snapshot.tokens_used_hour = tokens_used_hour;
        snapshot.tokens_used_day = tokens_used_day;
        snapshot.thoughts_active = thoughts_active;
    }

    async fn sample_process(&self) -> (u64, u64) {
        let Some(pid) = self.pid else {
            return (0, 0);
        };
        let mut system = self.system.lock().await;
        system.refresh_process(pid);
        match system.process(pid) {
            Some(process) => (
                process.memory() / 1024 / 1024,
                process.cpu_usage().round() as u64,
            ),
            None => (0, 0),
        }
    }

    fn sample_disk(&self) -> (u64, u64) {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let best = disks
            .list()
            .iter()
            .filter(|d| self.db_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());
        match best {
            Some(disk) => (
                disk.available_space() / 1024 / 1024,
                (disk.total_space() - disk.available_space()) / 1024 / 1024,
            ),
            None => (0, 0),
        }
    }

    async fn count_active_thoughts(&self) -> u64 {
        let Some(pool) = &self.db else {
            return 0;
        };
        let count: Result<i64, sqlx::Error> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM thoughts WHERE status IN ('pending', 'processing')",
        )
        .fetch_one(pool)
        .await;
        match count {
            Ok(n) => n.max(0) as u64,
            Err(e) => {
                debug!("Active-thought query failed: {}", e);
                0
            }
        }
    }

    async fn check_limits(&self) {
        let values = {
            let mut snapshot = self.snapshot.write();
            snapshot.warnings.clear();
            snapshot.critical.clear();
            snapshot.healthy = true;
            [
                ("memory_mb", snapshot.memory_mb),
                ("cpu_percent", snapshot.cpu_average_1m),
                ("tokens_hour", snapshot.tokens_used_hour),
                ("tokens_day", snapshot.tokens_used_day),
                ("thoughts_active", snapshot.thoughts_active),
                ("disk_mb", snapshot.disk_used_mb),
            ]
        };

        for (name, value) in values {
            self.check_resource(name, value).await;
        }

        let mut snapshot = self.snapshot.write();
        if !snapshot.critical.is_empty() {
            snapshot.healthy = false;
        }
    }

    async fn check_resource(&self, name: &str, current_value: u64) {
        let Some(limit) = self.budget.limit_for(name) else {
            return;
        };
        let limit = limit.clone();
        if current_value >= limit.critical {
            self.snapshot
                .write()
                .critical
                .push(format!("{}: {}/{}", name, current_value, limit.limit));
            self.take_action(name, &limit, "critical").await;
        } else if current_value >= limit.warning {
            self.snapshot
                .write()
                .warnings
                .push(format!("{}: {}/{}", name, current_value, limit.limit));
            self.take_action(name, &limit, "warning").await;
        }
    }

    /// Emit the configured signal, rate-limited per (resource, level).
    async fn take_action(&self, resource: &str, config: &ResourceLimit, level: &str) {
        let key = format!("{}_{}", resource, level);
        let now = Utc::now();
        {
            let last_action = self.last_action.lock();
            if let Some(last) = last_action.get(&key) {
                if now - *last < ChronoDuration::seconds(config.cooldown_seconds as i64) {
                    return;
                }
            }
        }

        warn!(
            "Resource {} hit {} threshold, action: {:?}",
            resource, level, config.action
        );
        if let Some(signal) = config.action.signal() {
            self.signal_bus.emit(signal, resource).await;
        }
        if config.action == ResourceAction::Shutdown {
            error!("Resource {} triggered shutdown signal", resource);
        }
        self.last_action.lock().insert(key, now);
    }

    /// Admission check: would `amount` more of `resource` stay under the
    /// warning threshold?
    pub async fn check_available(&self, resource: &str, amount: u64) -> bool {
        let snapshot = self.snapshot.read();
        match resource {
            "memory_mb" => snapshot.memory_mb + amount < self.budget.memory_mb.warning,
            "tokens_hour" => snapshot.tokens_used_hour + amount < self.budget.tokens_hour.warning,
            "thoughts_active" => {
                snapshot.thoughts_active + amount < self.budget.thoughts_active.warning
            }
            _ => true,
        }
    }
}

#[async_trait]
impl TokenLedger for ResourceMonitor {
    async fn record_tokens(&self, tokens: u64) {
        let mut history = self.token_history.lock();
        history.push_back((Utc::now(), tokens));
        while history.len() > TOKEN_WINDOW {
            history.pop_front();
        }
    }
}

#[async_trait]
impl Service for ResourceMonitor {
    fn name(&self) -> &str {
        "ResourceMonitorService"
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.snapshot.read().healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_contracts::ResourceLimit;

    fn token_budget(warning: u64, critical: u64, cooldown: u64) -> ResourceBudget {
        ResourceBudget {
            tokens_hour: ResourceLimit::new(critical * 2, warning, critical, ResourceAction::Defer, cooldown),
            // Other thresholds far above anything a test process reaches.
            memory_mb: ResourceLimit::new(u64::MAX, u64::MAX - 2, u64::MAX - 1, ResourceAction::Defer, 60),
            cpu_percent: ResourceLimit::new(u64::MAX, u64::MAX - 2, u64::MAX - 1, ResourceAction::Throttle, 60),
            tokens_day: ResourceLimit::new(u64::MAX, u64::MAX - 2, u64::MAX - 1, ResourceAction::Reject, 60),
            thoughts_active: ResourceLimit::new(u64::MAX, u64::MAX - 2, u64::MAX - 1, ResourceAction::Defer, 60),
            disk_mb: ResourceLimit::new(u64::MAX, u64::MAX - 2, u64::MAX - 1, ResourceAction::Warn, 60),
        }
    }

    fn collecting_bus() -> (Arc<ResourceSignalBus>, Arc<Mutex<Vec<(String, String)>>>) {
        let bus = Arc::new(ResourceSignalBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for signal in ["throttle", "defer", "reject", "shutdown"] {
            let sink = Arc::clone(&seen);
            bus.register(
                signal,
                Arc::new(move |signal, resource| {
                    let sink = Arc::clone(&sink);
                    Box::pin(async move {
                        sink.lock().push((signal, resource));
                    })
                }),
            );
        }
        (bus, seen)
    }

    #[tokio::test]
    async fn token_overuse_marks_snapshot_unhealthy() {
        let (bus, _seen) = collecting_bus();
        let monitor = ResourceMonitor::new(token_budget(10, 100, 60), None, "/tmp", bus);

        monitor.record_tokens(150).await;
        monitor.tick().await;

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.tokens_used_hour, 150);
        assert!(!snapshot.healthy);
        assert_eq!(snapshot.critical.len(), 1);
        assert!(snapshot.critical[0].starts_with("tokens_hour:"));
    }

    #[tokio::test]
    async fn warning_band_stays_healthy() {
        let (bus, seen) = collecting_bus();
        let monitor = ResourceMonitor::new(token_budget(10, 100, 60), None, "/tmp", bus);

        monitor.record_tokens(50).await;
        monitor.tick().await;

        let snapshot = monitor.snapshot();
        assert!(snapshot.healthy);
        assert_eq!(snapshot.warnings.len(), 1);
        assert!(snapshot.critical.is_empty());
        // Warning level still emits the configured signal, once.
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn signals_respect_the_cooldown() {
        let (bus, seen) = collecting_bus();
        let monitor = ResourceMonitor::new(token_budget(10, 100, 1), None, "/tmp", bus);

        monitor.record_tokens(150).await;
        monitor.tick().await;
        monitor.tick().await;
        monitor.tick().await;
        assert_eq!(seen.lock().len(), 1, "cooldown must suppress repeats");

        tokio::time::sleep(Duration::from_millis(1100)).await;
        monitor.tick().await;
        assert_eq!(seen.lock().len(), 2);

        let (signal, resource) = seen.lock()[0].clone();
        assert_eq!(signal, "defer");
        assert_eq!(resource, "tokens_hour");
    }

    #[tokio::test]
    async fn check_available_uses_the_warning_threshold() {
        let (bus, _seen) = collecting_bus();
        let monitor = ResourceMonitor::new(token_budget(100, 1000, 60), None, "/tmp", bus);

        assert!(monitor.check_available("tokens_hour", 50).await);
        monitor.record_tokens(90).await;
        monitor.tick().await;
        assert!(!monitor.check_available("tokens_hour", 50).await);
        assert!(monitor.check_available("unknown_resource", 1).await);
    }
}
