//! Phase-ordered, verified system initialization.
//!
//! Steps are registered against a phase; phases execute in enum order and
//! steps within a phase run sequentially in registration order. Each step is
//! bounded by its own timeout, and an optional verifier (10 s budget) must
//! return true. A critical step failing aborts initialization.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fabric_contracts::Service;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

const VERIFIER_TIMEOUT: Duration = Duration::from_secs(10);

/// Boot phases, executed in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializationPhase {
    Infrastructure,
    Database,
    Memory,
    Security,
    Services,
    Components,
    Verification,
}

impl InitializationPhase {
    pub const ALL: [InitializationPhase; 7] = [
        InitializationPhase::Infrastructure,
        InitializationPhase::Database,
        InitializationPhase::Memory,
        InitializationPhase::Security,
        InitializationPhase::Services,
        InitializationPhase::Components,
        InitializationPhase::Verification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InitializationPhase::Infrastructure => "infrastructure",
            InitializationPhase::Database => "database",
            InitializationPhase::Memory => "memory",
            InitializationPhase::Security => "security",
            InitializationPhase::Services => "services",
            InitializationPhase::Components => "components",
            InitializationPhase::Verification => "verification",
        }
    }
}

type StepHandler = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type StepVerifier = Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// A single initialization step.
pub struct InitializationStep {
    pub phase: InitializationPhase,
    pub name: String,
    pub handler: StepHandler,
    pub verifier: Option<StepVerifier>,
    pub critical: bool,
    pub timeout: Duration,
}

/// Detailed initialization status.
#[derive(Debug, Clone, Serialize)]
pub struct InitializationStatus {
    pub complete: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub completed_steps: Vec<String>,
    pub phase_status: HashMap<String, String>,
    pub error: Option<String>,
    pub total_steps: usize,
}

/// Service coordinating system initialization.
pub struct InitializationService {
    steps: Mutex<Vec<InitializationStep>>,
    completed: Mutex<Vec<String>>,
    phase_status: Mutex<HashMap<InitializationPhase, String>>,
    start_time: Mutex<Option<DateTime<Utc>>>,
    error: Mutex<Option<String>>,
    complete: AtomicBool,
    running: AtomicBool,
}

impl Default for InitializationService {
    fn default() -> Self {
        Self::new()
    }
}

impl InitializationService {
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            phase_status: Mutex::new(HashMap::new()),
            start_time: Mutex::new(None),
            error: Mutex::new(None),
            complete: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Register an initialization step.
    pub fn register_step(&self, step: InitializationStep) {
        debug!("Registered initialization step: {}/{}", step.phase.as_str(), step.name);
        self.steps.lock().push(step);
    }

    pub fn is_initialized(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Initialize the entire system. Returns true on success; on failure the
    /// recorded error is available through `status()`.
    pub async fn initialize(&self) -> bool {
        *self.start_time.lock() = Some(Utc::now());
        info!("Initialization sequence starting");

        for phase in InitializationPhase::ALL {
            if !self.execute_phase(phase).await {
                let duration = self.elapsed_seconds();
                error!(
                    "Initialization failed in phase {} after {:.1}s: {}",
                    phase.as_str(),
                    duration.unwrap_or(0.0),
                    self.error.lock().as_deref().unwrap_or("unknown error"),
                );
                return false;
            }
        }

        self.complete.store(true, Ordering::SeqCst);
        info!(
            "Initialization complete ({:.1}s)",
            self.elapsed_seconds().unwrap_or(0.0)
        );
        true
    }

    async fn execute_phase(&self, phase: InitializationPhase) -> bool {
        // Indices of this phase's steps, in registration order. The lock is
        // released before any handler runs.
        let indices: Vec<usize> = {
            let steps = self.steps.lock();
            steps
                .iter()
                .enumerate()
                .filter(|(_, s)| s.phase == phase)
                .map(|(i, _)| i)
                .collect()
        };
        if indices.is_empty() {
            return true;
        }

        info!("Phase: {}", phase.as_str().to_uppercase());
        self.phase_status.lock().insert(phase, "running".to_string());

        for index in indices {
            if !self.execute_step(index).await {
                self.phase_status.lock().insert(phase, "failed".to_string());
                return false;
            }
        }

        self.phase_status.lock().insert(phase, "completed".to_string());
        info!("Phase {} completed successfully", phase.as_str());
        true
    }

    /// Run one step under its timeout plus verification. Returns false only
    /// for a failing critical step.
    async fn execute_step(&self, index: usize) -> bool {
        let (name, phase, critical, timeout, handler_future) = {
            let steps = self.steps.lock();
            let step = &steps[index];
            (
                step.name.clone(),
                step.phase,
                step.critical,
                step.timeout,
                (step.handler)(),
            )
        };
        let step_name = format!("{}/{}", phase.as_str(), name);
        info!("-> {}...", name);

        let failure = match tokio::time::timeout(timeout, handler_future).await {
            Err(_) => Some(format!("{} timed out after {:?}", name, timeout)),
            Ok(Err(e)) => Some(format!("{} failed: {}", name, e)),
            Ok(Ok(())) => {
                let verifier_future = {
                    let steps = self.steps.lock();
                    steps[index].verifier.as_ref().map(|v| v())
                };
                match verifier_future {
                    None => None,
                    Some(future) => {
                        debug!("Verifying {}...", name);
                        match tokio::time::timeout(VERIFIER_TIMEOUT, future).await {
                            Ok(true) => None,
                            Ok(false) => Some(format!("verification failed for {}", name)),
                            Err(_) => Some(format!("verification of {} timed out", name)),
                        }
                    }
                }
            }
        };

        match failure {
            None => {
                self.completed.lock().push(step_name);
                info!("  {} initialized", name);
                true
            }
            Some(message) => {
                error!("  {}", message);
                if critical {
                    *self.error.lock() = Some(message);
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn status(&self) -> InitializationStatus {
        InitializationStatus {
            complete: self.is_initialized(),
            start_time: *self.start_time.lock(),
            duration_seconds: self.elapsed_seconds(),
            completed_steps: self.completed.lock().clone(),
            phase_status: self
                .phase_status
                .lock()
                .iter()
                .map(|(phase, status)| (phase.as_str().to_string(), status.clone()))
                .collect(),
            error: self.error.lock().clone(),
            total_steps: self.steps.lock().len(),
        }
    }

    fn elapsed_seconds(&self) -> Option<f64> {
        self.start_time
            .lock()
            .map(|start| (Utc::now() - start).num_milliseconds() as f64 / 1000.0)
    }
}

#[async_trait]
impl Service for InitializationService {
    fn name(&self) -> &str {
        "InitializationService"
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("InitializationService started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        info!("InitializationService stopped");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && (self.is_initialized() || self.error.lock().is_none())
    }
}
