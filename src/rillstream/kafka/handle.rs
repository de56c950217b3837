//! Exclusive access to the non-thread-safe Kafka client.

use crate::rillstream::kafka::client::ConsumerClient;
use crate::rillstream::kafka::kafka_error::ConsumerError;
use std::sync::{Arc, Mutex};

/// Scoped wrapper owning the underlying Kafka client.
///
/// All client calls, from the actor and from user-facing operations alike,
/// go through [`ConsumerHandle::blocking`], which holds one mutex and runs
/// the closure on a thread that may block. Only operations the client
/// documents as safe while a poll is in flight elsewhere should be issued
/// from outside the actor; serialization through the shared mutex makes
/// even those calls exclusive.
pub struct ConsumerHandle<C> {
    client: Arc<Mutex<Option<C>>>,
}

impl<C> Clone for ConsumerHandle<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl<C: ConsumerClient> ConsumerHandle<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Arc::new(Mutex::new(Some(client))),
        }
    }

    /// Run `op` with exclusive access to the client, suspending the caller
    /// until the result is available.
    ///
    /// Returns `ConsumerError::Shutdown` when the handle has already been
    /// closed or the closure panicked.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T, ConsumerError>
    where
        F: FnOnce(&mut C) -> T + Send + 'static,
        T: Send + 'static,
    {
        let client = Arc::clone(&self.client);
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = client.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_mut() {
                Some(client) => Ok(op(client)),
                None => Err(ConsumerError::Shutdown),
            }
        })
        .await;
        joined.map_err(|_| ConsumerError::Shutdown)?
    }

    /// Close the client. Idempotent; close failures are swallowed.
    pub async fn close(&self) {
        let client = Arc::clone(&self.client);
        let result = tokio::task::spawn_blocking(move || {
            let taken = {
                let mut guard = client.lock().unwrap_or_else(|e| e.into_inner());
                guard.take()
            };
            if let Some(mut client) = taken {
                client.close();
            }
        })
        .await;
        if result.is_err() {
            log::warn!(target: "consumer_handle", "client close panicked; ignoring");
        }
    }

    /// Whether the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.client
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }
}
