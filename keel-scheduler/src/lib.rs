//! Cron scheduler for keel.
//!
//! An internal cron engine: 5-field expressions plus descriptors
//! (`@hourly`, `@every 90s`, ...), optionally pinned to a timezone with
//! `CRON_TZ=`, evaluated DST-correctly, and driven by a single run-loop task
//! with panic-recovering, non-overlapping job execution.
//!
//! ```ignore
//! let cron = Cron::new();
//! cron.add_fn("compact", "*/5 * * * *", || async {
//!     compact_segments().await;
//! })?;
//! cron.start_loop();
//! ```
//!
//! With an [`App`](keel_core::App), install [`SchedulerModule`] instead: the
//! scheduler reads `scheduler.timezone` from config, starts and stops with
//! the layered lifecycle, and reports through the health manager.

mod chain;
mod cron;
mod parser;
mod schedule;

pub use chain::{Chain, DelayIfStillRunning, Job, JobFuture, JobWrapper, Recover, SkipIfStillRunning};
pub use cron::{Cron, EntryId, EntryInfo};
pub use parser::{parse, ParseError};
pub use schedule::{ConstantDelaySchedule, Schedule, SpecSchedule};

use std::str::FromStr;

use chrono_tz::Tz;

use keel_core::app::App;
use keel_core::config::{
    ConfigFlag, ConfigProvider, ConfigValue, FlagKind, FlagSet, ProviderValues,
};
use keel_core::container::service_key;
use keel_core::error::CoreError;
use keel_core::health::{HealthIndicator, HealthManager, HealthStatus};
use keel_core::module::Module;

impl ConfigProvider for Cron {
    fn config_namespace() -> &'static str {
        "scheduler"
    }

    fn config_flags() -> Vec<ConfigFlag> {
        vec![ConfigFlag::new("timezone", FlagKind::String)
            .default_value(ConfigValue::String("UTC".to_string()))
            .describe("default timezone for cron expressions")]
    }
}

/// Health probe: a stopped scheduler reports down.
pub struct CronHealth {
    cron: Cron,
}

impl CronHealth {
    pub fn new(cron: Cron) -> Self {
        Self { cron }
    }
}

impl HealthIndicator for CronHealth {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn check(&self) -> HealthStatus {
        if self.cron.is_running() {
            HealthStatus::Up
        } else {
            HealthStatus::Down(
                CoreError::NotRunning {
                    subsystem: "scheduler",
                }
                .to_string(),
            )
        }
    }
}

/// Installs a lifecycle-managed [`Cron`] into the container.
///
/// The scheduler is registered eagerly so it participates in layered
/// start/stop even when nothing resolves it, and its timezone comes from
/// `scheduler.timezone` (flag `--scheduler-timezone`, env
/// `SCHEDULER_TIMEZONE`).
pub struct SchedulerModule;

impl Module for SchedulerModule {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn flags(&self, flags: &mut FlagSet) {
        flags.string_var(
            "scheduler-timezone",
            "UTC",
            "default timezone for cron expressions",
        );
    }

    fn register(&self, app: &mut App) -> Result<(), CoreError> {
        app.container()
            .register::<Cron>()
            .eager()
            .managed()
            .with_config()
            .provider(|c| {
                let values = c.resolve::<ProviderValues>()?;
                let zone = values.get_or("scheduler.timezone", "UTC".to_string());
                let tz = Tz::from_str(&zone).map_err(|_| CoreError::InvalidProvider {
                    key: service_key::<Cron>(None),
                    reason: format!("unknown timezone {zone:?}"),
                })?;
                let cron = Cron::with_timezone(tz);
                if let Ok(health) = c.resolve::<HealthManager>() {
                    health.register(CronHealth::new(cron.clone()));
                }
                Ok(cron)
            })
    }
}
