//! Layered start/stop ordering, blame logging, and rollback.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_core::error::ErrorKind;
use keel_core::lifecycle::{HookCtx, HookError, Lifecycle};
use keel_core::App;

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct Store {
    recorder: Recorder,
}

impl Lifecycle for Store {
    async fn start(&self, _ctx: HookCtx) -> Result<(), HookError> {
        self.recorder.push("store:start");
        Ok(())
    }

    async fn stop(&self, _ctx: HookCtx) -> Result<(), HookError> {
        self.recorder.push("store:stop");
        Ok(())
    }
}

#[derive(Clone)]
struct Server {
    #[allow(dead_code)]
    store: Store,
    recorder: Recorder,
    stop_delay: Duration,
}

impl Lifecycle for Server {
    async fn start(&self, _ctx: HookCtx) -> Result<(), HookError> {
        self.recorder.push("server:start");
        Ok(())
    }

    async fn stop(&self, _ctx: HookCtx) -> Result<(), HookError> {
        tokio::time::sleep(self.stop_delay).await;
        self.recorder.push("server:stop");
        Ok(())
    }
}

fn build_app(recorder: &Recorder, stop_delay: Duration) -> App {
    let mut app = App::new();
    app.with_args(Vec::<String>::new());
    let r1 = recorder.clone();
    let r2 = recorder.clone();
    app.provide(move |c| {
        c.register::<Store>()
            .eager()
            .managed()
            .provider_fn(move |_| Store {
                recorder: r1.clone(),
            })
    });
    app.provide(move |c| {
        c.register::<Server>().eager().managed().provider(move |c| {
            Ok(Server {
                store: c.resolve()?,
                recorder: r2.clone(),
                stop_delay,
            })
        })
    });
    app
}

#[tokio::test]
async fn dependencies_start_first_and_stop_last() {
    let recorder = Recorder::default();
    let mut app = build_app(&recorder, Duration::ZERO);

    app.start().await.unwrap();
    app.stop().await.unwrap();

    assert_eq!(
        recorder.events(),
        vec!["store:start", "server:start", "server:stop", "store:stop"]
    );
}

#[tokio::test]
async fn slow_stop_hook_is_blamed_but_shutdown_continues() {
    let recorder = Recorder::default();
    let mut app = build_app(&recorder, Duration::from_millis(200));
    app.with_stop_timeout_for::<Server>(Duration::from_millis(30));

    app.start().await.unwrap();
    let err = app.stop().await.unwrap_err();

    // The server's timeout is in the error; the store still stopped, and its
    // success is not.
    let message = err.to_string();
    assert!(message.contains("Server"), "{message}");
    assert!(message.contains("deadline"), "{message}");
    assert!(!message.contains("Store"), "{message}");
    assert_eq!(recorder.events().last().unwrap(), "store:stop");
}

#[tokio::test]
async fn stop_is_idempotent() {
    let recorder = Recorder::default();
    let mut app = build_app(&recorder, Duration::ZERO);

    app.start().await.unwrap();
    app.stop().await.unwrap();
    let before = recorder.events().len();
    app.stop().await.unwrap();
    assert_eq!(recorder.events().len(), before);
}

// ── Rollback on start failure ──────────────────────────────────────────────

#[derive(Clone)]
struct Faulty {
    #[allow(dead_code)]
    store: Store,
}

impl Lifecycle for Faulty {
    async fn start(&self, _ctx: HookCtx) -> Result<(), HookError> {
        Err("bind: address already in use".into())
    }
}

#[tokio::test]
async fn failed_start_rolls_back_started_layers() {
    let recorder = Recorder::default();
    let mut app = App::new();
    app.with_args(Vec::<String>::new());
    let r1 = recorder.clone();
    app.provide(move |c| {
        c.register::<Store>()
            .eager()
            .managed()
            .provider_fn(move |_| Store {
                recorder: r1.clone(),
            })
    });
    app.provide(|c| {
        c.register::<Faulty>()
            .eager()
            .managed()
            .provider(|c| Ok(Faulty { store: c.resolve()? }))
    });

    let err = app.start().await.unwrap_err();
    assert!(err.has_kind(ErrorKind::Hook));
    assert!(err.to_string().contains("address already in use"));

    // The store started in layer 0 and was stopped again by the rollback.
    assert_eq!(
        recorder.events(),
        vec!["store:start", "store:stop"]
    );
}

// ── Non-lifecycle intermediaries still order their dependents ──────────────

#[derive(Clone)]
struct PlainCache {
    #[allow(dead_code)]
    store: Store,
}

#[derive(Clone)]
struct Frontend {
    #[allow(dead_code)]
    cache: PlainCache,
    recorder: Recorder,
}

impl Lifecycle for Frontend {
    async fn start(&self, _ctx: HookCtx) -> Result<(), HookError> {
        self.recorder.push("frontend:start");
        Ok(())
    }
}

#[tokio::test]
async fn pass_through_services_preserve_depth_ordering() {
    let recorder = Recorder::default();
    let mut app = App::new();
    app.with_args(Vec::<String>::new());
    let r1 = recorder.clone();
    let r2 = recorder.clone();
    app.provide(move |c| {
        c.register::<Store>()
            .eager()
            .managed()
            .provider_fn(move |_| Store {
                recorder: r1.clone(),
            })
    });
    app.provide(|c| {
        c.register::<PlainCache>()
            .provider(|c| Ok(PlainCache { store: c.resolve()? }))
    });
    app.provide(move |c| {
        c.register::<Frontend>().eager().managed().provider(move |c| {
            Ok(Frontend {
                cache: c.resolve()?,
                recorder: r2.clone(),
            })
        })
    });

    app.start().await.unwrap();
    app.stop().await.unwrap();

    // The cache has no hooks, but its depth still places the frontend two
    // layers above the store.
    assert_eq!(
        recorder.events(),
        vec!["store:start", "frontend:start", "store:stop"]
    );
}

#[tokio::test]
async fn lazy_unresolved_services_stay_out_of_the_layering() {
    #[derive(Clone)]
    struct Unused {
        recorder: Recorder,
    }

    impl Lifecycle for Unused {
        async fn start(&self, _ctx: HookCtx) -> Result<(), HookError> {
            self.recorder.push("unused:start");
            Ok(())
        }
    }

    let recorder = Recorder::default();
    let mut app = App::new();
    app.with_args(Vec::<String>::new());
    let r1 = recorder.clone();
    let r2 = recorder.clone();
    app.provide(move |c| {
        // Lazy and never resolved: no instance exists, so no hook runs.
        c.register::<Unused>().managed().provider_fn(move |_| Unused {
            recorder: r1.clone(),
        })
    });
    app.provide(move |c| {
        c.register::<Store>()
            .eager()
            .managed()
            .provider_fn(move |_| Store {
                recorder: r2.clone(),
            })
    });

    app.start().await.unwrap();
    app.stop().await.unwrap();

    assert_eq!(recorder.events(), vec!["store:start", "store:stop"]);
}

#[tokio::test]
async fn cyclic_graph_fails_startup_with_cycle_error() {
    #[derive(Clone, Debug)]
    struct A;
    #[derive(Clone)]
    struct B;

    let mut app = App::new();
    app.with_args(Vec::<String>::new());
    app.provide(|c| {
        c.register::<A>().provider(|c| {
            c.resolve::<B>()?;
            Ok(A)
        })
    });
    app.provide(|c| {
        c.register::<B>().provider(|c| {
            c.resolve::<A>()?;
            Ok(B)
        })
    });
    app.build().unwrap();

    // Lazy resolution surfaces the cycle.
    let err = app.container().resolve::<A>().unwrap_err();
    assert!(err.has_kind(ErrorKind::Cycle));
}

#[tokio::test]
async fn start_errors_are_joined_across_a_layer() {
    #[derive(Clone)]
    struct F1;
    #[derive(Clone)]
    struct F2;

    impl Lifecycle for F1 {
        async fn start(&self, _ctx: HookCtx) -> Result<(), HookError> {
            Err("f1 failed".into())
        }
    }
    impl Lifecycle for F2 {
        async fn start(&self, _ctx: HookCtx) -> Result<(), HookError> {
            Err("f2 failed".into())
        }
    }

    let mut app = App::new();
    app.with_args(Vec::<String>::new());
    app.provide(|c| c.register::<F1>().eager().managed().provider_fn(|_| F1));
    app.provide(|c| c.register::<F2>().eager().managed().provider_fn(|_| F2));

    let err = app.start().await.unwrap_err();
    assert!(err.has_kind(ErrorKind::Hook));
    let message = err.to_string();
    assert!(message.contains("f1 failed"), "{message}");
    assert!(message.contains("f2 failed"), "{message}");
}
