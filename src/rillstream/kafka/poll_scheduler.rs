//! Periodic injection of low-priority poll requests.

use crate::rillstream::kafka::kafka_error::ConsumerError;
use crate::rillstream::kafka::lifecycle::ShutdownToken;
use crate::rillstream::kafka::requests::Request;
use std::time::Duration;
use tokio::sync::mpsc;

/// Offer one `Poll` token per interval into the capacity-1 poll queue.
///
/// The bounded offer blocks while the actor has not consumed the previous
/// token, which naturally dampens the poll rate when the actor is busy.
/// Shutdown unwinds both the offer and the sleep.
pub(crate) async fn run(
    polls: mpsc::Sender<Request>,
    interval: Duration,
    mut shutdown: ShutdownToken,
) -> Result<(), ConsumerError> {
    log::debug!(target: "poll_scheduler", "started with interval {:?}", interval);
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            sent = polls.send(Request::Poll) => {
                if sent.is_err() {
                    // actor gone; supervisor will wind us down
                    break;
                }
            }
        }
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    log::debug!(target: "poll_scheduler", "stopped");
    Ok(())
}
