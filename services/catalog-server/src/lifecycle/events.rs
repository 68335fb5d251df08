//! External triggers into the lifecycle.
//!
//! Termination signals, panics and failed background tasks all become
//! [`LifecycleEvent`]s on one channel, which the orchestrator consumes.

use std::fmt;
use std::fmt::Display;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Signal(ShutdownSignal),
    /// A panic anywhere in the process.
    UncaughtError(String),
    /// A background task ended with an error nobody awaited.
    UnhandledRejection(String),
}

/// Sending half of the lifecycle event channel.
#[derive(Debug, Clone)]
pub struct LifecycleEvents {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

pub fn channel() -> (LifecycleEvents, mpsc::UnboundedReceiver<LifecycleEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LifecycleEvents { tx }, rx)
}

impl LifecycleEvents {
    pub fn send(&self, event: LifecycleEvent) {
        if self.tx.send(event).is_err() {
            debug!("Lifecycle event dropped; orchestrator no longer listening");
        }
    }

    pub fn signal(&self, signal: ShutdownSignal) {
        self.send(LifecycleEvent::Signal(signal));
    }

    pub fn uncaught_error(&self, message: impl Into<String>) {
        self.send(LifecycleEvent::UncaughtError(message.into()));
    }

    pub fn unhandled_rejection(&self, message: impl Into<String>) {
        self.send(LifecycleEvent::UnhandledRejection(message.into()));
    }
}

/// Forward SIGINT and SIGTERM into the event channel.
pub fn spawn_signal_listener(events: LifecycleEvents) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = forward_signals(&events).await {
            error!(error = %e, "Failed to install signal handlers");
            events.uncaught_error(format!("signal handlers unavailable: {e}"));
        }
    })
}

#[cfg(unix)]
async fn forward_signals(events: &LifecycleEvents) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                events.signal(ShutdownSignal::Terminate);
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                events.signal(ShutdownSignal::Interrupt);
            }
        }
    }
}

#[cfg(not(unix))]
async fn forward_signals(events: &LifecycleEvents) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
        events.signal(ShutdownSignal::Interrupt);
    }
}

/// Report every panic as an uncaught error, after the previous hook ran.
pub fn install_panic_hook(events: LifecycleEvents) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        events.uncaught_error(info.to_string());
    }));
}

/// Watch a background task and report its failure as an unhandled rejection.
pub fn supervise<E>(
    events: LifecycleEvents,
    task: &'static str,
    handle: JoinHandle<Result<(), E>>,
) -> JoinHandle<()>
where
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(())) => info!(task, "Task exited"),
            Ok(Err(e)) => {
                warn!(task, error = %e, "Task failed");
                events.unhandled_rejection(format!("{task}: {e}"));
            }
            Err(e) => {
                warn!(task, error = %e, "Task panicked or was cancelled");
                events.unhandled_rejection(format!("{task}: {e}"));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_supervise_reports_failure() {
        let (events, mut rx) = channel();
        let task = tokio::spawn(async { Err::<(), _>("listener closed") });

        supervise(events, "http-server", task).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(LifecycleEvent::UnhandledRejection(
                "http-server: listener closed".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_supervise_clean_exit_is_silent() {
        let (events, mut rx) = channel();
        let task = tokio::spawn(async { Ok::<(), String>(()) });

        supervise(events, "http-server", task).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_panic_hook_reports_uncaught_error() {
        let saved = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));

        let (events, mut rx) = channel();
        install_panic_hook(events);

        let joined = tokio::spawn(async { panic!("worker exploded") }).await;
        assert!(joined.unwrap_err().is_panic());

        let event = rx.recv().await;

        let _ = std::panic::take_hook();
        std::panic::set_hook(saved);

        match event {
            Some(LifecycleEvent::UncaughtError(message)) => {
                assert!(message.contains("worker exploded"), "{message}");
            }
            other => panic!("expected an uncaught error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_is_harmless() {
        let (events, rx) = channel();
        drop(rx);
        events.signal(ShutdownSignal::Interrupt);
    }
}
