//! Modules: named bundles of provider registrations plus an optional flag
//! contribution.
//!
//! `App::install` queues a module; `App::build` drains the queue, invoking
//! [`Module::flags`] for every module first (so the CLI parser knows all
//! flags before it runs) and [`Module::register`] second. Two modules with
//! the same name fail the build with a `DuplicateModule` error.

use crate::app::App;
use crate::config::FlagSet;
use crate::error::CoreError;

/// A composable unit of functionality installed into an [`App`].
///
/// ```ignore
/// pub struct MetricsModule;
///
/// impl Module for MetricsModule {
///     fn name(&self) -> &'static str {
///         "metrics"
///     }
///
///     fn flags(&self, flags: &mut FlagSet) {
///         flags.int_var("metrics-port", 9100, "metrics listener port");
///     }
///
///     fn register(&self, app: &mut App) -> Result<(), CoreError> {
///         app.container().register::<Registry>().eager().provider(|c| {
///             let values = c.resolve::<ProviderValues>()?;
///             Registry::bind(values.get_int("metrics.port")?)
///         })
///     }
/// }
/// ```
pub trait Module: Send + Sync + 'static {
    /// Stable module name; uniqueness is enforced per app.
    fn name(&self) -> &'static str;

    /// Contribute flag descriptors. Conventionally named `<module>-<key>`.
    fn flags(&self, flags: &mut FlagSet) {
        let _ = flags;
    }

    /// Register providers into the app's container.
    fn register(&self, app: &mut App) -> Result<(), CoreError>;
}
