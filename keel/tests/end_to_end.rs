//! Full-stack wiring: modules, config, scheduler, event bus, health.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel::prelude::*;
use keel_events::EventBus;
use keel_scheduler::Cron;

struct Heartbeat {
    seq: usize,
}

#[tokio::test]
async fn scheduler_publishes_to_the_bus_under_app_lifecycle() {
    let received = Arc::new(AtomicUsize::new(0));

    let mut app = App::new();
    app.with_args(["--scheduler-timezone", "UTC"]);
    app.install(HealthModule);
    app.install(EventsModule);
    app.install(SchedulerModule);

    app.build().unwrap();

    let bus = app.container().resolve::<EventBus>().unwrap();
    let counter = received.clone();
    let sub = bus
        .subscribe(move |beat: Arc<Heartbeat>| {
            let counter = counter.clone();
            async move {
                let _ = beat.seq;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    let cron = app.container().resolve::<Cron>().unwrap();
    let bus_for_job = bus.clone();
    let seq = Arc::new(AtomicUsize::new(0));
    cron.add_fn("heartbeat", "@every 30ms", move || {
        let bus = bus_for_job.clone();
        let seq = seq.clone();
        async move {
            let n = seq.fetch_add(1, Ordering::SeqCst);
            let _ = bus.publish(Heartbeat { seq: n }).await;
        }
    })
    .unwrap();

    app.start().await.unwrap();

    let health = app.container().resolve::<HealthManager>().unwrap();
    let report = health.report().await;
    assert!(report.up, "all subsystems should be up: {report:?}");
    assert!(report.checks.iter().any(|c| c.name == "scheduler"));
    assert!(report.checks.iter().any(|c| c.name == "events"));

    tokio::time::sleep(Duration::from_millis(150)).await;
    sub.unsubscribe().await;
    assert!(received.load(Ordering::SeqCst) >= 2);

    app.stop().await.unwrap();

    // Stop closed the bus and parked the scheduler.
    assert!(!cron.is_running());
    assert!(bus.is_closed());
    let report = health.report().await;
    assert!(!report.up, "stopped subsystems report down");
}

#[tokio::test]
async fn build_reports_module_config_in_one_pass() {
    let mut app = App::new();
    app.with_args(["--scheduler-timezone", "Mars/Olympus"]);
    app.install(SchedulerModule);

    let err = app.build().unwrap_err();
    assert!(err.to_string().contains("Mars/Olympus"), "{err}");
}

#[tokio::test]
async fn scheduler_module_respects_configured_timezone() {
    let mut app = App::new();
    app.with_args(["--scheduler-timezone", "Europe/Paris"]);
    app.install(SchedulerModule);
    app.build().unwrap();

    let cron = app.container().resolve::<Cron>().unwrap();
    assert_eq!(cron.timezone(), chrono_tz::Europe::Paris);
}
