//! Core runtime for keel: a type-indexed dependency-injection container, a
//! layered lifecycle engine, module/flag/config composition, worker
//! supervision, and health probing.
//!
//! The typical shape of an application:
//!
//! ```ignore
//! let mut app = App::new();
//! app.install(HealthModule);
//! app.provide(|c| {
//!     c.register::<Server>()
//!         .eager()
//!         .managed()
//!         .provider(|c| Server::bind(&c.resolve::<ProviderValues>()?))
//! });
//! std::process::exit(app.execute().await);
//! ```

pub mod app;
pub mod config;
pub mod container;
pub mod error;
pub mod health;
pub mod inject;
pub mod lifecycle;
mod logging;
pub mod module;
pub mod shutdown;
pub mod worker;

pub use app::App;
pub use config::{ConfigFlag, ConfigProvider, FlagKind, FlagSet, ProviderValues};
pub use container::{service_key, Binding, Container, Scope};
pub use error::{CoreError, ErrorKind};
pub use health::{HealthIndicator, HealthManager, HealthModule, HealthStatus};
pub use inject::Inject;
pub use lifecycle::{compute_layers, HookCtx, HookError, Lifecycle};
pub use module::Module;
pub use shutdown::{ManualSignals, OsSignals, SignalSource};
pub use worker::{BackoffPolicy, Supervisor, Worker, WorkerModule};

pub mod prelude {
    //! Re-exports of the most commonly used types.
    pub use crate::app::App;
    pub use crate::config::{ConfigFlag, ConfigProvider, FlagKind, FlagSet, ProviderValues};
    pub use crate::container::Container;
    pub use crate::error::{CoreError, ErrorKind};
    pub use crate::health::{HealthIndicator, HealthManager, HealthModule, HealthStatus};
    pub use crate::inject::Inject;
    pub use crate::lifecycle::{HookCtx, HookError, Lifecycle};
    pub use crate::module::Module;
    pub use crate::worker::{BackoffPolicy, Supervisor, Worker, WorkerModule};
}
