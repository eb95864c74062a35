//! Process-wide shutdown.
//!
//! One [`CancellationToken`] is shared by every event source and the dispatcher.
//! It is cancelled on SIGINT or SIGTERM, or as soon as a source fails. A
//! second signal exits immediately, without waiting for the action in flight.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{ShutdownError, SourceError};
use crate::handler::Handler;
use crate::source::EventSource;

pub struct Coordinator {
    shutdown: CancellationToken,
    sources: JoinSet<(String, Result<(), SourceError>)>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            sources: JoinSet::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels the shared token on the first SIGINT or SIGTERM and exits the
    /// process on the second.
    pub fn trap_signals(&self) -> std::io::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let (received, signals) = mpsc::channel(1);

        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    Some(()) = sigint.recv() => "SIGINT",
                    Some(()) = sigterm.recv() => "SIGTERM",
                    else => break,
                };
                if received.send(name).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(escalate_signals(signals, self.shutdown.clone(), || {
            std::process::exit(FORCED_EXIT_CODE)
        }));
        Ok(())
    }

    /// Runs `source` in the task group. If it fails or panics, everything shuts down.
    pub fn spawn_source(&mut self, mut source: Box<dyn EventSource>) {
        let shutdown = self.shutdown.clone();
        self.sources.spawn(async move {
            // Disarmed on a clean return; dropped (cancelling the token) on error or panic.
            let guard = shutdown.clone().drop_guard();
            let name = source.name();
            let result = source.listen(shutdown).await;
            match &result {
                Ok(()) => {
                    guard.disarm();
                }
                Err(error) => {
                    error!(source = %name, %error, "event source failed, shutting down");
                    drop(guard);
                }
            }
            (name, result)
        });
    }

    /// Dispatches notices until shutdown, then waits for every source.
    ///
    /// Returns the first source failure, if any.
    pub async fn run<H: Handler>(mut self, dispatcher: Dispatcher<H>) -> Result<(), ShutdownError> {
        dispatcher.run(self.shutdown.clone()).await;
        // The dispatcher may also stop because every source is gone.
        self.shutdown.cancel();

        let mut first_failure = None;
        while let Some(joined) = self.sources.join_next().await {
            let failure = match joined {
                Ok((name, Ok(()))) => {
                    info!(source = %name, "event source finished");
                    None
                }
                Ok((name, Err(error))) => Some(ShutdownError::SourceFailed { name, error }),
                Err(join_error) => {
                    error!(error = %join_error, "event source task panicked");
                    Some(ShutdownError::SourcePanicked(join_error.to_string()))
                }
            };
            if first_failure.is_none() {
                first_failure = failure;
            }
        }

        first_failure.map_or(Ok(()), Err)
    }
}

/// 128 + SIGINT, as a shell reports an interrupted process.
const FORCED_EXIT_CODE: i32 = 130;

async fn escalate_signals<F>(
    mut signals: mpsc::Receiver<&'static str>,
    shutdown: CancellationToken,
    force_exit: F,
) where
    F: FnOnce(),
{
    let Some(first) = signals.recv().await else {
        return;
    };
    info!(signal = first, "received signal, shutting down");
    shutdown.cancel();

    if let Some(second) = signals.recv().await {
        warn!(signal = second, "received second signal, exiting now");
        force_exit();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use lifecycle_common::notice::Notice;

    use super::*;
    use crate::dispatcher::notice_channel;
    use crate::error::HandlerError;

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _notice: &Notice) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Waits for shutdown, or fails after `fail_after`.
    struct StubSource {
        name: &'static str,
        fail_after: Option<Duration>,
        panic: bool,
    }

    #[async_trait]
    impl EventSource for StubSource {
        fn name(&self) -> String {
            self.name.to_owned()
        }

        async fn listen(&mut self, shutdown: CancellationToken) -> Result<(), SourceError> {
            match self.fail_after {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    if self.panic {
                        panic!("source blew up");
                    }
                    Err(SourceError::DispatcherClosed(self.name.to_owned()))
                }
                None => {
                    shutdown.cancelled().await;
                    Ok(())
                }
            }
        }
    }

    fn idle(name: &'static str) -> Box<StubSource> {
        Box::new(StubSource {
            name,
            fail_after: None,
            panic: false,
        })
    }

    fn dispatcher() -> (
        Dispatcher<CountingHandler>,
        tokio::sync::mpsc::Sender<Notice>,
    ) {
        let (tx, rx) = notice_channel();
        (
            Dispatcher::new(rx, CountingHandler(Arc::new(AtomicUsize::new(0)))),
            tx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_everything() {
        let mut coordinator = Coordinator::new();
        coordinator.spawn_source(idle("spot"));
        coordinator.spawn_source(idle("queue launch-queue"));
        let shutdown = coordinator.shutdown_token();
        let (dispatcher, _tx) = dispatcher();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shutdown.cancel();
        });

        assert!(coordinator.run(dispatcher).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_failure_shuts_down() {
        let mut coordinator = Coordinator::new();
        coordinator.spawn_source(idle("spot"));
        coordinator.spawn_source(Box::new(StubSource {
            name: "queue launch-queue",
            fail_after: Some(Duration::from_secs(3)),
            panic: false,
        }));
        let shutdown = coordinator.shutdown_token();
        let (dispatcher, _tx) = dispatcher();

        let result = coordinator.run(dispatcher).await;
        assert!(shutdown.is_cancelled());
        assert!(matches!(
            result,
            Err(ShutdownError::SourceFailed { name, .. }) if name == "queue launch-queue"
        ));
    }

    #[tokio::test]
    async fn test_first_signal_cancels_second_forces_exit() {
        let (tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let forced = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(escalate_signals(rx, shutdown.clone(), {
            let forced = forced.clone();
            move || {
                forced.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tx.send("SIGTERM").await.unwrap();
        shutdown.cancelled().await;
        assert_eq!(forced.load(Ordering::SeqCst), 0);

        tx.send("SIGINT").await.unwrap();
        task.await.unwrap();
        assert_eq!(forced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_signal_does_not_force_exit() {
        let (tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let forced = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(escalate_signals(rx, shutdown.clone(), {
            let forced = forced.clone();
            move || {
                forced.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tx.send("SIGINT").await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert!(shutdown.is_cancelled());
        assert_eq!(forced.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_panic_shuts_down() {
        let mut coordinator = Coordinator::new();
        coordinator.spawn_source(idle("spot"));
        coordinator.spawn_source(Box::new(StubSource {
            name: "queue launch-queue",
            fail_after: Some(Duration::from_secs(3)),
            panic: true,
        }));
        let (dispatcher, _tx) = dispatcher();

        let result = coordinator.run(dispatcher).await;
        assert!(matches!(result, Err(ShutdownError::SourcePanicked(_))));
    }
}
