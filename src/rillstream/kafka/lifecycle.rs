//! Supervision of the actor / poll-scheduler task pair.
//!
//! The two long-running tasks are joined so that either one finishing, for
//! any reason, cancels the other. A failure propagates to
//! `await_termination`; a clean exit reports success.

use crate::rillstream::kafka::kafka_error::ConsumerError;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

type TermState = Option<Result<(), ConsumerError>>;

/// Cooperative cancellation signal observed by every internal task.
#[derive(Debug, Clone)]
pub(crate) struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Resolves once shutdown has been signalled. Also resolves if the
    /// signalling side disappeared, which only happens at teardown.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Clonable view of the consumer's termination state, raced by operations
/// that must not outlive the consumer.
#[derive(Debug, Clone)]
pub(crate) struct TerminationWatch {
    rx: watch::Receiver<TermState>,
}

impl TerminationWatch {
    /// Completes when the consumer has terminated, with its final result.
    pub async fn wait(mut self) -> Result<(), ConsumerError> {
        loop {
            if let Some(result) = self.rx.borrow().clone() {
                return result;
            }
            if self.rx.changed().await.is_err() {
                return Err(ConsumerError::Shutdown);
            }
        }
    }
}

pub(crate) fn shutdown_channel() -> (Arc<watch::Sender<bool>>, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (Arc::new(tx), ShutdownToken { rx })
}

/// Handle to the supervised task pair.
pub(crate) struct Lifecycle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    term_rx: watch::Receiver<TermState>,
}

impl Lifecycle {
    /// Spawn the supervisor over the already-running actor and scheduler
    /// tasks. Whichever finishes first cancels its sibling; an actor error
    /// wins over a clean scheduler exit.
    pub fn supervise(
        shutdown_tx: Arc<watch::Sender<bool>>,
        actor: JoinHandle<Result<(), ConsumerError>>,
        scheduler: JoinHandle<Result<(), ConsumerError>>,
    ) -> Self {
        let (term_tx, term_rx) = watch::channel(None);
        let shutdown = Arc::clone(&shutdown_tx);

        tokio::spawn(async move {
            let mut actor = actor;
            let mut scheduler = scheduler;
            let result = tokio::select! {
                joined = &mut actor => {
                    let actor_result = flatten(joined);
                    let _ = shutdown.send(true);
                    let _ = (&mut scheduler).await;
                    actor_result
                }
                joined = &mut scheduler => {
                    let scheduler_result = flatten(joined);
                    let _ = shutdown.send(true);
                    // the actor still runs its finalization; its verdict wins
                    let actor_result = flatten((&mut actor).await);
                    if actor_result.is_err() {
                        actor_result
                    } else {
                        scheduler_result
                    }
                }
            };
            if let Err(err) = &result {
                log::error!(target: "consumer_lifecycle", "consumer terminated with error: {}", err);
            } else {
                log::debug!(target: "consumer_lifecycle", "consumer terminated");
            }
            let _ = term_tx.send(Some(result));
        });

        Self {
            shutdown_tx,
            term_rx,
        }
    }

    /// Signal shutdown without waiting for completion.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Cancel both tasks and wait for the pair to wind down.
    pub async fn terminate(&self) -> Result<(), ConsumerError> {
        self.signal_shutdown();
        self.await_termination().await
    }

    /// Wait until the consumer has terminated, surfacing an actor failure.
    pub async fn await_termination(&self) -> Result<(), ConsumerError> {
        self.termination_watch().wait().await
    }

    pub fn termination_watch(&self) -> TerminationWatch {
        TerminationWatch {
            rx: self.term_rx.clone(),
        }
    }
}

fn flatten(
    joined: Result<Result<(), ConsumerError>, tokio::task::JoinError>,
) -> Result<(), ConsumerError> {
    match joined {
        Ok(result) => result,
        Err(join_err) => {
            log::error!(target: "consumer_lifecycle", "internal task aborted: {}", join_err);
            Err(ConsumerError::Shutdown)
        }
    }
}
