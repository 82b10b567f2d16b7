//! Struct-field injection.
//!
//! A provider constructs its value first; when the registration chained
//! `.inject()`, the container then calls [`Inject::inject`] on the value
//! inside the same resolution frame, so injected lookups record dependency
//! edges and participate in cycle detection like any nested resolve.
//!
//! Implementations are normally generated by `#[derive(Inject)]` from
//! `keel-macros`:
//!
//! ```ignore
//! #[derive(Clone, Inject)]
//! struct Api {
//!     #[inject]
//!     repo: Repo,
//!     #[inject(name = "replica")]
//!     replica: Db,
//!     #[inject(optional)]
//!     metrics: Option<Metrics>,
//!     started_at: Instant, // untouched
//! }
//! ```

use crate::container::Container;
use crate::error::{CoreError, ErrorKind};

/// Populate a value's fields from the container.
pub trait Inject {
    fn inject(&mut self, container: &Container) -> Result<(), CoreError>;
}

/// Resolve a dependency that may legitimately be absent.
///
/// `NotFound` (including one buried under a resolution-chain wrapper) maps to
/// `Ok(None)`; any other failure stays fatal. Used by the
/// `#[inject(optional)]` expansion.
pub fn resolve_optional<T: Clone + Send + Sync + 'static>(
    container: &Container,
    name: Option<&str>,
) -> Result<Option<T>, CoreError> {
    let result = match name {
        Some(name) => container.resolve_named::<T>(name),
        None => container.resolve::<T>(),
    };
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.has_kind(ErrorKind::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Db {
        url: String,
    }

    #[derive(Clone, Default)]
    struct Handler {
        db: Option<Db>,
        label: String,
    }

    impl Inject for Handler {
        fn inject(&mut self, container: &Container) -> Result<(), CoreError> {
            self.db = resolve_optional(container, None)?;
            Ok(())
        }
    }

    #[test]
    fn injection_runs_after_provider() {
        let c = Container::new();
        c.register::<Db>()
            .provider_fn(|_| Db {
                url: "postgres://".into(),
            })
            .unwrap();
        c.register::<Handler>()
            .inject()
            .provider_fn(|_| Handler {
                db: None,
                label: "orders".into(),
            })
            .unwrap();

        let handler = c.resolve::<Handler>().unwrap();
        assert_eq!(handler.label, "orders");
        assert_eq!(handler.db.unwrap().url, "postgres://");
    }

    #[test]
    fn optional_injection_tolerates_missing_dependency() {
        let c = Container::new();
        c.register::<Handler>()
            .inject()
            .provider_fn(|_| Handler::default())
            .unwrap();

        let handler = c.resolve::<Handler>().unwrap();
        assert!(handler.db.is_none());
    }

    #[test]
    fn injected_lookups_record_edges() {
        let c = Container::new();
        c.register::<Db>()
            .provider_fn(|_| Db { url: "x".into() })
            .unwrap();
        c.register::<Handler>()
            .inject()
            .provider_fn(|_| Handler::default())
            .unwrap();
        c.resolve::<Handler>().unwrap();

        let graph = c.dependency_graph();
        let deps = graph
            .get(&crate::container::service_key::<Handler>(None))
            .unwrap();
        assert_eq!(deps, &vec![crate::container::service_key::<Db>(None)]);
    }

    #[test]
    fn instance_with_inject_is_rejected() {
        let c = Container::new();
        let err = c
            .register::<Handler>()
            .inject()
            .instance(Handler::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSettable);
    }
}
