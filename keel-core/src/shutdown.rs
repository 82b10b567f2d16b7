//! Interrupt-signal plumbing for [`App::run`](crate::app::App::run).
//!
//! The signal source is a trait object so the lifecycle engine stays
//! testable: production uses [`OsSignals`] (SIGINT/SIGTERM), tests inject
//! [`ManualSignals`] and fire interrupts deterministically.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// A detachable source of interrupt signals.
pub trait SignalSource: Send + Sync + 'static {
    /// Subscribe to interrupts. Every delivered signal is one `()` on the
    /// channel; a first signal requests graceful shutdown, a second one
    /// forces exit.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<()>;
}

/// Platform interrupt signals: SIGINT and SIGTERM on unix, ctrl-c elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSignals;

impl SignalSource for OsSignals {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut interrupt = match signal(SignalKind::interrupt()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(error = %e, "cannot install SIGINT handler");
                        return;
                    }
                };
                let mut terminate = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(error = %e, "cannot install SIGTERM handler");
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        _ = interrupt.recv() => {}
                        _ = terminate.recv() => {}
                    }
                    if tx.send(()).is_err() {
                        return;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                loop {
                    if tokio::signal::ctrl_c().await.is_err() {
                        return;
                    }
                    if tx.send(()).is_err() {
                        return;
                    }
                }
            }
        });
        rx
    }
}

/// Test signal source: interrupts are delivered by calling
/// [`ManualSignals::interrupt`].
#[derive(Clone, Default)]
pub struct ManualSignals {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<()>>>>,
}

impl ManualSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one interrupt to every subscriber.
    pub fn interrupt(&self) {
        let subscribers = self.subscribers.lock().expect("signal list poisoned");
        for tx in subscribers.iter() {
            let _ = tx.send(());
        }
    }
}

impl SignalSource for ManualSignals {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("signal list poisoned")
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_signals_reach_every_subscriber() {
        let signals = ManualSignals::new();
        let mut a = signals.subscribe();
        let mut b = signals.subscribe();

        signals.interrupt();
        a.recv().await.unwrap();
        b.recv().await.unwrap();

        signals.interrupt();
        signals.interrupt();
        a.recv().await.unwrap();
        a.recv().await.unwrap();
    }
}
