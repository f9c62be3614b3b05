//! State-change notifications
//!
//! Every observer gets its own bounded buffer (a broadcast receiver). The
//! registry never waits on observers: a slow observer loses its oldest
//! notifications and is told how many it missed.

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{trace, warn};

use crate::module::traits::ModuleState;
use crate::utils::time::current_timestamp_millis;

/// One lifecycle transition of one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub module: String,
    pub old: ModuleState,
    pub new: ModuleState,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

/// Fan-out side held by the registry
#[derive(Debug, Clone)]
pub(crate) struct StateNotifier {
    tx: broadcast::Sender<StateChange>,
}

impl StateNotifier {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget; having no observers is not an error
    pub(crate) fn notify(&self, module: &str, old: ModuleState, new: ModuleState) {
        trace!("Module {} state {} -> {}", module, old, new);
        let _ = self.tx.send(StateChange {
            module: module.to_string(),
            old,
            new,
            timestamp_ms: current_timestamp_millis(),
        });
    }

    pub(crate) fn subscribe(&self) -> StateSubscription {
        StateSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer handle returned by `subscribe_state_changes`
#[derive(Debug)]
pub struct StateSubscription {
    rx: broadcast::Receiver<StateChange>,
}

impl StateSubscription {
    /// Wait for the next notification; `None` once the registry is gone
    pub async fn recv(&mut self) -> Option<StateChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(RecvError::Lagged(missed)) => {
                    warn!("State observer lagged, {} notifications dropped", missed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered notification, if any
    pub fn try_recv(&mut self) -> Option<StateChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) => return Some(change),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!("State observer lagged, {} notifications dropped", missed);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<StateChange> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Consume the subscription as a stream of notifications
    pub fn into_stream(self) -> impl Stream<Item = StateChange> {
        stream::unfold(self, |mut sub| async move {
            let next = sub.recv().await;
            next.map(|change| (change, sub))
        })
    }
}
