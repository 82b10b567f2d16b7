//! Health probing with liveness/readiness semantics.
//!
//! Subsystems register named [`HealthIndicator`]s with the [`HealthManager`];
//! callers (an HTTP adapter, an ops CLI) ask for an aggregated
//! [`HealthReport`]. Readiness skips liveness-only checks.
//!
//! ```ignore
//! struct DbHealth { pool: Pool }
//!
//! impl HealthIndicator for DbHealth {
//!     fn name(&self) -> &str { "db" }
//!     async fn check(&self) -> HealthStatus {
//!         match self.pool.ping().await {
//!             Ok(_) => HealthStatus::Up,
//!             Err(e) => HealthStatus::Down(e.to_string()),
//!         }
//!     }
//! }
//! ```

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::app::App;
use crate::error::CoreError;
use crate::module::Module;

/// Result of a single health check.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down(String),
}

impl HealthStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, HealthStatus::Up)
    }
}

/// A named health indicator.
pub trait HealthIndicator: Send + Sync + 'static {
    /// The name of this check (e.g. `"db"`, `"scheduler"`).
    fn name(&self) -> &str;

    /// Perform the check.
    fn check(&self) -> impl std::future::Future<Output = HealthStatus> + Send;

    /// Whether this check gates readiness (default `true`). Liveness-only
    /// checks (disk space, debug endpoints) return `false`.
    fn affects_readiness(&self) -> bool {
        true
    }
}

/// Object-safe wrapper for [`HealthIndicator`].
#[doc(hidden)]
pub trait HealthIndicatorErased: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn check(&self)
        -> std::pin::Pin<Box<dyn std::future::Future<Output = HealthStatus> + Send + '_>>;
    fn affects_readiness(&self) -> bool;
}

impl<T: HealthIndicator> HealthIndicatorErased for T {
    fn name(&self) -> &str {
        HealthIndicator::name(self)
    }

    fn check(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = HealthStatus> + Send + '_>> {
        Box::pin(HealthIndicator::check(self))
    }

    fn affects_readiness(&self) -> bool {
        HealthIndicator::affects_readiness(self)
    }
}

/// A single check result in the aggregated report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub duration_ms: u64,
}

/// Aggregated health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub up: bool,
    pub checks: Vec<HealthCheck>,
    pub uptime_seconds: u64,
}

struct ManagerInner {
    checks: Mutex<Vec<Arc<dyn HealthIndicatorErased>>>,
    start_time: Instant,
}

/// Registry of health indicators, resolvable from the container.
#[derive(Clone)]
pub struct HealthManager {
    inner: Arc<ManagerInner>,
}

impl Default for HealthManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                checks: Mutex::new(Vec::new()),
                start_time: Instant::now(),
            }),
        }
    }

    /// Register an indicator.
    pub fn register<H: HealthIndicator>(&self, indicator: H) {
        self.inner
            .checks
            .lock()
            .expect("health check list poisoned")
            .push(Arc::new(indicator));
    }

    /// Run every check and aggregate.
    pub async fn report(&self) -> HealthReport {
        self.aggregate(false).await
    }

    /// Run only the checks that gate readiness.
    pub async fn readiness(&self) -> HealthReport {
        self.aggregate(true).await
    }

    async fn aggregate(&self, readiness_only: bool) -> HealthReport {
        let indicators: Vec<Arc<dyn HealthIndicatorErased>> = {
            let checks = self
                .inner
                .checks
                .lock()
                .expect("health check list poisoned");
            checks
                .iter()
                .filter(|c| !readiness_only || c.affects_readiness())
                .cloned()
                .collect()
        };

        let mut checks = Vec::with_capacity(indicators.len());
        let mut up = true;
        for indicator in indicators {
            let begin = Instant::now();
            let status = indicator.check().await;
            if !status.is_up() {
                up = false;
            }
            checks.push(HealthCheck {
                name: indicator.name().to_string(),
                status,
                duration_ms: begin.elapsed().as_millis() as u64,
            });
        }

        HealthReport {
            up,
            checks,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }
}

/// Installs a [`HealthManager`] instance into the container.
pub struct HealthModule;

impl Module for HealthModule {
    fn name(&self) -> &'static str {
        "health"
    }

    fn register(&self, app: &mut App) -> Result<(), CoreError> {
        app.container()
            .register::<HealthManager>()
            .instance(HealthManager::new())
    }
}
