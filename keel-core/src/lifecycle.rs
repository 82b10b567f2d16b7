//! Lifecycle hooks and the layered start/stop engine.
//!
//! Services opt into lifecycle management by implementing [`Lifecycle`] and
//! chaining `.managed()` on their registration. The engine derives a layered
//! order from the container's dependency graph (recorded during resolution):
//! a service's depth is `1 + max(depth of its dependencies)`, all hooks within
//! a layer run concurrently, and shutdown replays the recorded layers in
//! reverse with per-hook deadlines and blame logging.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::container::Container;
use crate::error::CoreError;

/// Error type returned by lifecycle hooks and workers.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Context handed to every lifecycle hook.
///
/// Carries the cooperative cancellation token and, for stop hooks, the
/// deadline the engine will enforce. Hooks that block must select against
/// [`HookCtx::cancelled`].
#[derive(Clone, Debug)]
pub struct HookCtx {
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl HookCtx {
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self { cancel, timeout }
    }

    /// A free-standing context with no deadline (useful in tests).
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            timeout: None,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Completes when the surrounding phase is being cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The deadline the engine enforces on this hook, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Start/stop contract for container-managed services.
///
/// Both hooks default to no-ops so a service can implement only the side it
/// needs. Implementations must be cheap to clone (hold their state behind an
/// `Arc`).
#[diagnostic::on_unimplemented(
    message = "`{Self}` does not implement `Lifecycle`",
    label = "this type cannot be registered with .managed()",
    note = "implement `Lifecycle` (start/stop default to no-ops) for your service type"
)]
pub trait Lifecycle: Clone + Send + Sync + 'static {
    fn start(&self, ctx: HookCtx) -> impl Future<Output = Result<(), HookError>> + Send {
        let _ = ctx;
        async { Ok(()) }
    }

    fn stop(&self, ctx: HookCtx) -> impl Future<Output = Result<(), HookError>> + Send {
        let _ = ctx;
        async { Ok(()) }
    }
}

// ── Layer computation ──────────────────────────────────────────────────────

/// Group every node of the dependency graph into layers by dependency depth.
///
/// `graph` maps a service key to the keys it depends on. Leaves have depth 0;
/// any other node sits one layer above its deepest dependency, so every edge
/// points from a higher layer to a strictly lower one. Layer membership is
/// sorted for deterministic output. Nodes of every kind participate: the
/// caller filters non-lifecycle services *after* depth computation so
/// pass-through intermediaries still separate their dependents correctly.
pub fn compute_layers(graph: &HashMap<String, Vec<String>>) -> Result<Vec<Vec<String>>, CoreError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done(usize),
    }

    fn depth_of(
        key: &str,
        graph: &HashMap<String, Vec<String>>,
        marks: &mut HashMap<String, Mark>,
        trail: &mut Vec<String>,
    ) -> Result<usize, CoreError> {
        match marks.get(key) {
            Some(Mark::Done(d)) => return Ok(*d),
            Some(Mark::Visiting) => {
                let mut chain: Vec<String> = trail
                    .iter()
                    .skip_while(|k| k.as_str() != key)
                    .cloned()
                    .collect();
                chain.push(key.to_string());
                return Err(CoreError::Cycle { chain });
            }
            None => {}
        }

        marks.insert(key.to_string(), Mark::Visiting);
        trail.push(key.to_string());

        let mut depth = 0;
        if let Some(deps) = graph.get(key) {
            for dep in deps {
                depth = depth.max(1 + depth_of(dep, graph, marks, trail)?);
            }
        }

        trail.pop();
        marks.insert(key.to_string(), Mark::Done(depth));
        Ok(depth)
    }

    let mut marks = HashMap::new();
    let mut by_depth: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut keys: Vec<&String> = graph.keys().collect();
    keys.sort();

    for key in keys {
        let mut trail = Vec::new();
        let depth = depth_of(key, graph, &mut marks, &mut trail)?;
        by_depth.entry(depth).or_default().push(key.clone());
    }

    Ok(by_depth
        .into_values()
        .map(|mut layer| {
            layer.sort();
            layer
        })
        .collect())
}

// ── Engine ─────────────────────────────────────────────────────────────────

pub(crate) struct StopSettings {
    pub(crate) default_timeout: Duration,
    pub(crate) per_service: HashMap<String, Duration>,
    pub(crate) global_deadline: Duration,
}

/// Start every layer in ascending order, hooks within a layer concurrent.
///
/// On failure the layers started so far are stopped again in reverse under
/// `rollback` settings, then the joined start errors are returned.
pub(crate) async fn start_layers(
    container: &Container,
    layers: &[Vec<String>],
    cancel: &CancellationToken,
    rollback: &StopSettings,
) -> Result<(), CoreError> {
    let mut started: Vec<Vec<String>> = Vec::new();

    for layer in layers {
        let mut set: JoinSet<(String, Result<(), HookError>)> = JoinSet::new();

        for key in layer {
            let ctx = HookCtx::new(cancel.child_token(), None);
            if let Some(fut) = container.start_hook(key, ctx) {
                let key = key.clone();
                set.spawn(async move { (key.clone(), fut.await) });
            }
        }

        let mut errors = Vec::new();
        let mut succeeded = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((key, Ok(()))) => {
                    tracing::debug!(service = %key, "service started");
                    succeeded.push(key);
                }
                Ok((key, Err(e))) => errors.push(CoreError::Hook {
                    key,
                    message: format!("start hook failed: {e}"),
                }),
                Err(join_err) => errors.push(CoreError::Hook {
                    key: "<unknown>".to_string(),
                    message: format!("start hook panicked: {join_err}"),
                }),
            }
        }
        succeeded.sort();
        started.push(succeeded);

        if !errors.is_empty() {
            tracing::error!(
                failed = errors.len(),
                "startup aborted, rolling back started services"
            );
            let mut rollback_layers = started.clone();
            rollback_layers.reverse();
            let _ = tokio::time::timeout(
                rollback.global_deadline,
                stop_layers(container, &rollback_layers, cancel, rollback),
            )
            .await;
            return CoreError::join(errors);
        }
    }

    Ok(())
}

/// Stop every layer in the given (already reversed) order.
///
/// Each hook runs under its per-service deadline; a hook that exceeds it is
/// blamed in a structured log and counted in the joined error, but shutdown
/// proceeds to the remaining hooks and layers. The whole phase is bounded by
/// the global deadline.
pub(crate) async fn stop_layers(
    container: &Container,
    layers: &[Vec<String>],
    cancel: &CancellationToken,
    settings: &StopSettings,
) -> Result<(), CoreError> {
    let phase = async {
        let mut errors = Vec::new();

        for layer in layers {
            let mut set: JoinSet<(String, Result<(), CoreError>)> = JoinSet::new();

            for key in layer {
                let timeout = settings
                    .per_service
                    .get(key)
                    .copied()
                    .unwrap_or(settings.default_timeout);
                let ctx = HookCtx::new(cancel.child_token(), Some(timeout));
                if let Some(fut) = container.stop_hook(key, ctx) {
                    let key = key.clone();
                    set.spawn(async move {
                        let begin = Instant::now();
                        let outcome = match tokio::time::timeout(timeout, fut).await {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(e)) => Err(CoreError::Hook {
                                key: key.clone(),
                                message: format!("stop hook failed: {e}"),
                            }),
                            Err(_) => {
                                // Blame log: name the service holding up shutdown.
                                tracing::warn!(
                                    service = %key,
                                    timeout = ?timeout,
                                    elapsed = ?begin.elapsed(),
                                    "stop hook exceeded its deadline"
                                );
                                Err(CoreError::Hook {
                                    key: key.clone(),
                                    message: format!(
                                        "stop hook exceeded its {timeout:?} deadline"
                                    ),
                                })
                            }
                        };
                        (key, outcome)
                    });
                }
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((key, Ok(()))) => tracing::debug!(service = %key, "service stopped"),
                    Ok((_, Err(e))) => errors.push(e),
                    Err(join_err) => errors.push(CoreError::Hook {
                        key: "<unknown>".to_string(),
                        message: format!("stop hook panicked: {join_err}"),
                    }),
                }
            }
        }

        CoreError::join(errors)
    };

    match tokio::time::timeout(settings.global_deadline, phase).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Hook {
            key: "<shutdown>".to_string(),
            message: format!(
                "global shutdown deadline of {:?} exceeded",
                settings.global_deadline
            ),
        }),
    }
}
