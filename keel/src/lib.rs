//! keel: an application runtime framework for long-running services and
//! CLIs.
//!
//! This facade crate re-exports the keel sub-crates through a single
//! dependency with feature flags. Import everything you need with:
//!
//! ```ignore
//! use keel::prelude::*;
//! ```
//!
//! # Feature flags
//!
//! | Feature     | Default | Crate            |
//! |-------------|---------|------------------|
//! | `scheduler` | **yes** | `keel-scheduler` |
//! | `events`    | **yes** | `keel-events`    |
//! | `full`      | no      | All of the above |
//!
//! # A minimal service
//!
//! ```ignore
//! use keel::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut app = App::new();
//!     app.install(HealthModule);
//!     app.install(SchedulerModule);
//!     app.provide(|c| {
//!         c.register::<Ingest>()
//!             .eager()
//!             .managed()
//!             .provider(|c| Ingest::connect(&c.resolve::<ProviderValues>()?))
//!     });
//!     std::process::exit(app.execute().await);
//! }
//! ```

// Re-export sub-crates as public modules so they're accessible as
// `keel::keel_core`, `keel::keel_events`, etc.
//
// The proc macros use `proc-macro-crate` to detect whether the user depends
// on `keel` (facade) or individual crates, and generate the correct paths.
pub extern crate keel_core;
pub extern crate keel_macros;

// Re-export everything from keel-core at the top level for convenience.
pub use keel_core::*;
pub use keel_macros::Inject;

#[cfg(feature = "scheduler")]
pub use keel_scheduler;

#[cfg(feature = "events")]
pub use keel_events;

pub mod prelude {
    //! Re-exports of the most commonly used types.
    pub use keel_core::prelude::*;
    pub use keel_macros::Inject;

    #[cfg(feature = "scheduler")]
    pub use keel_scheduler::{Cron, Job, Schedule, SchedulerModule};

    #[cfg(feature = "events")]
    pub use keel_events::{EventBus, EventsModule, Subscription};
}
