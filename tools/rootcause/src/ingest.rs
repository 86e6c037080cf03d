use crate::errors::RcaError;
use crate::types::RawFailure;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Producer half handed to runner adapters. Cloneable; the queue closes when
/// every sender is dropped.
#[derive(Debug, Clone)]
pub struct FailureSender {
    tx: mpsc::Sender<RawFailure>,
}

#[derive(Debug)]
pub struct FailureReceiver {
    rx: mpsc::Receiver<RawFailure>,
}

pub fn bounded(capacity: usize) -> (FailureSender, FailureReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FailureSender { tx }, FailureReceiver { rx })
}

impl FailureSender {
    /// Blocks while the queue is full. Must not be called from inside an
    /// async runtime.
    pub fn push(&self, failure: RawFailure) -> Result<(), RcaError> {
        self.tx
            .blocking_send(failure)
            .map_err(|_| RcaError::Io("failure queue closed".to_string()))
    }

    pub fn try_push(&self, failure: RawFailure) -> Result<bool, RcaError> {
        match self.tx.try_send(failure) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(RcaError::Io("failure queue closed".to_string()))
            }
        }
    }
}

impl FailureReceiver {
    /// Waits for the first failure, then takes whatever else is already
    /// queued, up to `max_batch`. Empty once the queue is closed and drained.
    pub fn recv_batch(&mut self, max_batch: usize) -> Vec<RawFailure> {
        let max_batch = max_batch.max(1);
        let mut batch = Vec::new();
        let Some(first) = self.rx.blocking_recv() else {
            return batch;
        };
        batch.push(first);
        while batch.len() < max_batch {
            match self.rx.try_recv() {
                Ok(failure) => batch.push(failure),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        batch
    }

    /// Non-blocking drain of everything currently queued.
    pub fn drain(&mut self) -> Vec<RawFailure> {
        let mut batch = Vec::new();
        while let Ok(failure) = self.rx.try_recv() {
            batch.push(failure);
        }
        batch
    }
}
