//! Type-indexed dependency-injection container.
//!
//! Services are registered under a key derived from their concrete type name
//! (plus an optional `[name]` suffix) through the fluent [`Binding`] builder,
//! and resolved with [`Container::resolve`]. Resolution tracks the chain of
//! in-flight keys in a thread-local stack: nested resolves performed by
//! providers record dependency edges as a side effect, and a key re-entered
//! on the same thread is a cycle. The recorded graph later drives lifecycle
//! layering.

mod binding;
mod wrapper;

pub use binding::Binding;
pub use wrapper::Scope;

pub(crate) use wrapper::{ErasedValue, HookFuture};

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::ConfigFlag;
use crate::error::{CoreError, ErrorKind};
use crate::lifecycle::HookCtx;

use wrapper::ServiceWrapper;

/// The registry key for a service type, optionally suffixed with `[name]`.
///
/// Deterministic for a given concrete type across processes; used verbatim in
/// error messages and dependency-edge recording.
pub fn service_key<T: 'static>(name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{}[{name}]", std::any::type_name::<T>()),
        None => std::any::type_name::<T>().to_string(),
    }
}

thread_local! {
    /// Keys currently being resolved on this thread, outermost first.
    static CHAIN: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Scope guard for one resolution frame; pops on drop so a panicking
/// provider cannot leave its key on the chain.
struct ChainFrame;

impl ChainFrame {
    fn push(key: &str) -> Self {
        CHAIN.with(|chain| chain.borrow_mut().push(key.to_string()));
        ChainFrame
    }
}

impl Drop for ChainFrame {
    fn drop(&mut self) {
        CHAIN.with(|chain| {
            chain.borrow_mut().pop();
        });
    }
}

struct ContainerInner {
    services: RwLock<HashMap<String, Arc<ServiceWrapper>>>,
    /// key -> keys it depends on; edges deduplicated, insertion-ordered.
    graph: RwLock<HashMap<String, Vec<String>>>,
    built: AtomicBool,
    /// Set when an eager provider panicked during build; blocks re-building.
    poison: Mutex<Option<(String, String)>>,
}

/// Thread-safe service registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let services = self.inner.services.read().expect("service map poisoned");
        f.debug_struct("Container")
            .field("services", &services.len())
            .field("built", &self.inner.built.load(Ordering::SeqCst))
            .finish()
    }
}

impl Container {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                services: RwLock::new(HashMap::new()),
                graph: RwLock::new(HashMap::new()),
                built: AtomicBool::new(false),
                poison: Mutex::new(None),
            }),
        }
    }

    // ── Registration ───────────────────────────────────────────────────────

    /// Start a fluent registration for `T`.
    pub fn register<T: Clone + Send + Sync + 'static>(&self) -> Binding<'_, T> {
        Binding::new(self)
    }

    pub(crate) fn insert_wrapper(
        &self,
        wrapper: ServiceWrapper,
        replace: bool,
    ) -> Result<(), CoreError> {
        if self.inner.built.load(Ordering::SeqCst) {
            return Err(CoreError::AlreadyBuilt);
        }
        let mut services = self.inner.services.write().expect("service map poisoned");
        let key = wrapper.key.clone();
        if replace {
            if !services.contains_key(&key) {
                return Err(CoreError::NotFound { key });
            }
        } else if services.contains_key(&key) {
            return Err(CoreError::Duplicate { key });
        }
        services.insert(key, Arc::new(wrapper));
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────────────

    pub fn contains<T: 'static>(&self) -> bool {
        self.has_key(&service_key::<T>(None))
    }

    pub fn contains_named<T: 'static>(&self, name: &str) -> bool {
        self.has_key(&service_key::<T>(Some(name)))
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.inner
            .services
            .read()
            .expect("service map poisoned")
            .contains_key(key)
    }

    /// Every registered service key, sorted.
    pub fn service_keys(&self) -> Vec<String> {
        let services = self.inner.services.read().expect("service map poisoned");
        let mut keys: Vec<String> = services.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of the recorded dependency graph (key -> its dependencies).
    pub fn dependency_graph(&self) -> HashMap<String, Vec<String>> {
        self.inner.graph.read().expect("graph poisoned").clone()
    }

    // ── Resolution ─────────────────────────────────────────────────────────

    /// Resolve the service registered for `T`.
    pub fn resolve<T: Clone + Send + Sync + 'static>(&self) -> Result<T, CoreError> {
        self.resolve_key(&service_key::<T>(None))
    }

    /// Resolve the service registered for `T` under `name`.
    pub fn resolve_named<T: Clone + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<T, CoreError> {
        self.resolve_key(&service_key::<T>(Some(name)))
    }

    /// Resolve, panicking on failure.
    ///
    /// For call sites that have already proved the service exists (typically
    /// after a successful build). Anywhere else, prefer [`Container::resolve`].
    pub fn must_resolve<T: Clone + Send + Sync + 'static>(&self) -> T {
        self.resolve::<T>()
            .unwrap_or_else(|e| panic!("must_resolve::<{}>: {e}", std::any::type_name::<T>()))
    }

    fn resolve_key<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Result<T, CoreError> {
        let value = self.resolve_erased(key)?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| CoreError::TypeMismatch {
                key: key.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    pub(crate) fn resolve_erased(&self, key: &str) -> Result<ErasedValue, CoreError> {
        // Snapshot the chain as it will look inside this frame; also the
        // cycle probe: the key re-appearing among its own ancestors.
        let chain_with_key = CHAIN.with(|chain| {
            let mut snapshot = chain.borrow().clone();
            snapshot.push(key.to_string());
            snapshot
        });
        let nested = chain_with_key.len() >= 2;

        if chain_with_key[..chain_with_key.len() - 1]
            .iter()
            .any(|k| k == key)
        {
            return Err(CoreError::Cycle {
                chain: chain_with_key,
            });
        }

        // Record the edge parent -> key before anything can fail, so even a
        // failed resolve leaves the attempted dependency visible.
        if nested {
            self.record_edge(&chain_with_key[chain_with_key.len() - 2], key);
        }

        let wrapper = {
            let services = self.inner.services.read().expect("service map poisoned");
            services.get(key).cloned()
        };
        let Some(wrapper) = wrapper else {
            let err = CoreError::NotFound {
                key: key.to_string(),
            };
            return Err(if nested {
                err.in_chain(chain_with_key)
            } else {
                err
            });
        };

        self.touch_node(key);

        // The service-map lock is already released: the provider is free to
        // resolve further services. The frame guard pops even on panic.
        let result = {
            let _frame = ChainFrame::push(key);
            wrapper.resolve_value(self)
        };

        result.map_err(|e| {
            if nested {
                e.in_chain(chain_with_key)
            } else {
                e
            }
        })
    }

    fn record_edge(&self, from: &str, to: &str) {
        let mut graph = self.inner.graph.write().expect("graph poisoned");
        let deps = graph.entry(from.to_string()).or_default();
        if !deps.iter().any(|d| d == to) {
            deps.push(to.to_string());
        }
    }

    fn touch_node(&self, key: &str) {
        let mut graph = self.inner.graph.write().expect("graph poisoned");
        graph.entry(key.to_string()).or_default();
    }

    // ── Build ──────────────────────────────────────────────────────────────

    /// Freeze registration and instantiate every eager singleton.
    ///
    /// Independent eager failures are joined so the operator sees every
    /// problem in one pass. Idempotent after the first success; a failed
    /// build un-freezes so the registration set can be repaired, except after
    /// a provider panic, which poisons the container for good.
    pub fn build(&self) -> Result<(), CoreError> {
        if let Some((key, payload)) = self
            .inner
            .poison
            .lock()
            .expect("poison flag poisoned")
            .clone()
        {
            return Err(CoreError::ProviderPanic { key, payload });
        }
        if self.inner.built.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut eager: Vec<Arc<ServiceWrapper>> = {
            let services = self.inner.services.read().expect("service map poisoned");
            services.values().filter(|w| w.eager).cloned().collect()
        };
        eager.sort_by(|a, b| a.key.cmp(&b.key));

        let mut errors = Vec::new();
        for wrapper in eager {
            if let Err(e) = self.resolve_erased(&wrapper.key) {
                if let CoreError::ProviderPanic { key, payload } = e.root_cause() {
                    let mut poison = self.inner.poison.lock().expect("poison flag poisoned");
                    poison.get_or_insert((key.clone(), payload.clone()));
                }
                errors.push(e);
            }
        }

        let result = CoreError::join(errors);
        if result.is_err() {
            self.inner.built.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Whether [`Container::build`] has completed successfully.
    pub fn built(&self) -> bool {
        self.inner.built.load(Ordering::SeqCst)
    }

    // ── Lifecycle plumbing ─────────────────────────────────────────────────

    /// The start hook future for `key`, when the service is managed and
    /// instantiated.
    pub(crate) fn start_hook(&self, key: &str, ctx: HookCtx) -> Option<HookFuture> {
        let wrapper = self.wrapper(key)?;
        let hooks = wrapper.hooks.as_ref()?;
        let value = wrapper.cached()?;
        Some(hooks.start(&value, ctx))
    }

    /// The stop hook future for `key`, when the service is managed and
    /// instantiated.
    pub(crate) fn stop_hook(&self, key: &str, ctx: HookCtx) -> Option<HookFuture> {
        let wrapper = self.wrapper(key)?;
        let hooks = wrapper.hooks.as_ref()?;
        let value = wrapper.cached()?;
        Some(hooks.stop(&value, ctx))
    }

    /// Whether `key` participates in layered start/stop: it is managed and
    /// its instance exists. Lazy singletons that were never resolved stay out.
    pub(crate) fn lifecycle_ready(&self, key: &str) -> bool {
        self.wrapper(key)
            .map(|w| w.hooks.is_some() && w.initialized())
            .unwrap_or(false)
    }

    /// Namespaced config contracts recorded via `.with_config()`, keyed by
    /// the owning service.
    pub(crate) fn config_contracts(&self) -> Vec<(String, &'static str, Vec<ConfigFlag>)> {
        let services = self.inner.services.read().expect("service map poisoned");
        let mut contracts: Vec<_> = services
            .values()
            .filter_map(|w| {
                w.config
                    .as_ref()
                    .map(|(ns, flags)| (w.key.clone(), *ns, flags.clone()))
            })
            .collect();
        contracts.sort_by(|a, b| a.0.cmp(&b.0));
        contracts
    }

    fn wrapper(&self, key: &str) -> Option<Arc<ServiceWrapper>> {
        self.inner
            .services
            .read()
            .expect("service map poisoned")
            .get(key)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::compute_layers;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Debug)]
    struct Db {
        url: String,
    }

    #[derive(Clone, Debug)]
    struct Repo {
        db: Db,
    }

    #[derive(Clone)]
    struct Api {
        repo: Repo,
    }

    fn register_stack(c: &Container) {
        c.register::<Db>()
            .provider_fn(|_| Db {
                url: "sqlite::memory:".into(),
            })
            .unwrap();
        c.register::<Repo>()
            .provider(|c| Ok(Repo { db: c.resolve()? }))
            .unwrap();
        c.register::<Api>()
            .provider(|c| Ok(Api { repo: c.resolve()? }))
            .unwrap();
    }

    #[test]
    fn resolve_transitive_chain() {
        let c = Container::new();
        register_stack(&c);
        let api = c.resolve::<Api>().unwrap();
        assert_eq!(api.repo.db.url, "sqlite::memory:");
    }

    #[test]
    fn resolution_records_edges_and_layers() {
        let c = Container::new();
        register_stack(&c);
        c.resolve::<Api>().unwrap();

        let graph = c.dependency_graph();
        assert_eq!(
            graph.get(&service_key::<Api>(None)).unwrap(),
            &vec![service_key::<Repo>(None)]
        );
        assert_eq!(
            graph.get(&service_key::<Repo>(None)).unwrap(),
            &vec![service_key::<Db>(None)]
        );

        let layers = compute_layers(&graph).unwrap();
        assert_eq!(
            layers,
            vec![
                vec![service_key::<Db>(None)],
                vec![service_key::<Repo>(None)],
                vec![service_key::<Api>(None)],
            ]
        );
    }

    #[test]
    fn singleton_provider_runs_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let c = Container::new();
        c.register::<Db>()
            .provider_fn(|_| {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Db { url: "x".into() }
            })
            .unwrap();
        c.resolve::<Db>().unwrap();
        c.resolve::<Db>().unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_first_resolves_share_one_invocation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Container::new();
        {
            let calls = calls.clone();
            c.register::<Db>()
                .provider_fn(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    Db { url: "x".into() }
                })
                .unwrap();
        }

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let c = c.clone();
                std::thread::spawn(move || c.resolve::<Db>().unwrap())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_resolves_are_fresh() {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        #[derive(Clone)]
        struct Stamp(usize);

        let c = Container::new();
        c.register::<Stamp>()
            .transient()
            .provider_fn(|_| Stamp(COUNTER.fetch_add(1, Ordering::SeqCst)))
            .unwrap();

        let a = c.resolve::<Stamp>().unwrap();
        let b = c.resolve::<Stamp>().unwrap();
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn named_registrations_are_distinct() {
        let c = Container::new();
        c.register::<Db>()
            .named("primary")
            .provider_fn(|_| Db {
                url: "primary".into(),
            })
            .unwrap();
        c.register::<Db>()
            .named("replica")
            .provider_fn(|_| Db {
                url: "replica".into(),
            })
            .unwrap();

        assert_eq!(c.resolve_named::<Db>("primary").unwrap().url, "primary");
        assert_eq!(c.resolve_named::<Db>("replica").unwrap().url, "replica");
        assert!(!c.contains::<Db>());
        assert!(c.contains_named::<Db>("primary"));
    }

    #[test]
    fn duplicate_key_is_rejected_without_replace() {
        let c = Container::new();
        c.register::<Db>()
            .provider_fn(|_| Db { url: "a".into() })
            .unwrap();
        let err = c
            .register::<Db>()
            .provider_fn(|_| Db { url: "b".into() })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
    }

    #[test]
    fn replace_overrides_and_requires_existing() {
        let c = Container::new();
        let err = c
            .register::<Db>()
            .replace()
            .provider_fn(|_| Db { url: "a".into() })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        c.register::<Db>()
            .provider_fn(|_| Db { url: "a".into() })
            .unwrap();
        c.register::<Db>()
            .replace()
            .provider_fn(|_| Db { url: "b".into() })
            .unwrap();
        assert_eq!(c.resolve::<Db>().unwrap().url, "b");
    }

    #[test]
    fn eager_transient_is_invalid() {
        let c = Container::new();
        let err = c
            .register::<Db>()
            .transient()
            .eager()
            .provider_fn(|_| Db { url: "a".into() })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidProvider);
    }

    #[test]
    fn missing_service_is_not_found() {
        let c = Container::new();
        let err = c.resolve::<Db>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn cycle_is_detected_with_full_chain() {
        #[derive(Clone, Debug)]
        struct A;
        #[derive(Clone)]
        struct B;

        let c = Container::new();
        c.register::<A>()
            .provider(|c| {
                c.resolve::<B>()?;
                Ok(A)
            })
            .unwrap();
        c.register::<B>()
            .provider(|c| {
                c.resolve::<A>()?;
                Ok(B)
            })
            .unwrap();

        let err = c.resolve::<A>().unwrap_err();
        assert!(err.has_kind(ErrorKind::Cycle));
        let message = err.to_string();
        let a = service_key::<A>(None);
        let b = service_key::<B>(None);
        assert!(
            message.contains(&format!("{a} -> {b} -> {a}")),
            "unexpected cycle message: {message}"
        );
    }

    #[test]
    fn nested_failure_reports_resolution_chain() {
        let c = Container::new();
        c.register::<Repo>()
            .provider(|c| Ok(Repo { db: c.resolve()? }))
            .unwrap();
        let err = c.resolve::<Repo>().unwrap_err();
        assert!(err.has_kind(ErrorKind::NotFound));
        let message = err.to_string();
        assert!(message.starts_with("resolving "), "{message}");
        assert!(message.contains(&service_key::<Repo>(None)), "{message}");
        assert!(message.contains(&service_key::<Db>(None)), "{message}");
    }

    #[test]
    fn provider_panic_is_recovered() {
        let c = Container::new();
        c.register::<Db>()
            .provider_fn(|_| panic!("boom at init"))
            .unwrap();
        let err = c.resolve::<Db>().unwrap_err();
        assert!(err.has_kind(ErrorKind::ProviderPanic));
        assert!(err.to_string().contains("boom at init"));

        // The thread-local chain unwound cleanly: resolving again re-runs the
        // provider instead of reporting a bogus cycle.
        let err = c.resolve::<Db>().unwrap_err();
        assert!(err.has_kind(ErrorKind::ProviderPanic));
    }

    #[test]
    fn build_instantiates_eager_singletons() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let c = Container::new();
        c.register::<Db>()
            .eager()
            .provider_fn(|_| {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Db { url: "x".into() }
            })
            .unwrap();
        c.build().unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        c.resolve::<Db>().unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn build_is_idempotent_and_freezes_registration() {
        let c = Container::new();
        c.register::<Db>()
            .provider_fn(|_| Db { url: "x".into() })
            .unwrap();
        c.build().unwrap();
        c.build().unwrap();

        let err = c
            .register::<Repo>()
            .provider(|c| Ok(Repo { db: c.resolve()? }))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyBuilt);
    }

    #[test]
    fn build_joins_independent_eager_failures() {
        #[derive(Clone)]
        struct Broken1;
        #[derive(Clone)]
        struct Broken2;

        let c = Container::new();
        c.register::<Broken1>()
            .eager()
            .provider(|_| {
                Err(CoreError::NotFound {
                    key: "upstream-1".into(),
                })
            })
            .unwrap();
        c.register::<Broken2>()
            .eager()
            .provider(|_| {
                Err(CoreError::NotFound {
                    key: "upstream-2".into(),
                })
            })
            .unwrap();

        let err = c.build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aggregate);
        let message = err.to_string();
        assert!(message.contains("upstream-1"), "{message}");
        assert!(message.contains("upstream-2"), "{message}");
    }

    #[test]
    fn build_after_eager_panic_stays_poisoned() {
        let c = Container::new();
        c.register::<Db>()
            .eager()
            .provider_fn(|_| panic!("init exploded"))
            .unwrap();
        let first = c.build().unwrap_err();
        assert!(first.has_kind(ErrorKind::ProviderPanic));

        let second = c.build().unwrap_err();
        assert!(second.has_kind(ErrorKind::ProviderPanic));
        assert!(second.to_string().contains("init exploded"));
    }

    #[test]
    fn instance_is_returned_verbatim() {
        let c = Container::new();
        c.register::<Db>()
            .instance(Db {
                url: "prebuilt".into(),
            })
            .unwrap();
        assert_eq!(c.resolve::<Db>().unwrap().url, "prebuilt");
    }

    #[test]
    #[should_panic(expected = "must_resolve")]
    fn must_resolve_panics_on_missing() {
        let c = Container::new();
        let _: Db = c.must_resolve();
    }
}
