use crate::errors::RcaError;
use crate::logging::append_run_log;
use serde_json::json;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shared flag a caller flips to stop an analysis early.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Deadline,
    Cancelled,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deadline => "deadline exceeded",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Deadline and cancellation checks for stages that run on the calling
/// thread.
#[derive(Debug, Clone, Default)]
pub struct StageBudget {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl StageBudget {
    pub fn new(deadline: Instant, cancel: &CancellationToken) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: cancel.clone(),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn check(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::Deadline),
            _ => None,
        }
    }
}

/// Per-item results by input position. `None` marks items that never
/// finished; `Some(Err)` carries a worker panic message.
#[derive(Debug)]
pub struct PoolOutcome<R> {
    pub results: Vec<Option<Result<R, String>>>,
    pub stopped: Option<StopReason>,
}

pub fn resolve_workers(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Runs `work` over `items` on at most `workers` threads. Items are claimed
/// through an atomic cursor. Once the deadline passes or `cancel` fires the
/// collector stops waiting; threads still busy are abandoned and stop
/// claiming new items.
pub fn run_bounded<T, R, F>(
    stage: &str,
    items: Arc<Vec<T>>,
    workers: usize,
    deadline: Instant,
    cancel: &CancellationToken,
    work: F,
) -> Result<PoolOutcome<R>, RcaError>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(&T) -> R + Send + Sync + 'static,
{
    let total = items.len();
    let mut results = (0..total).map(|_| None).collect::<Vec<_>>();
    if total == 0 {
        return Ok(PoolOutcome {
            results,
            stopped: None,
        });
    }

    if cancel.is_cancelled() || Instant::now() >= deadline {
        let reason = if cancel.is_cancelled() {
            StopReason::Cancelled
        } else {
            StopReason::Deadline
        };
        append_run_log(
            "warn",
            "worker_pool.skipped",
            json!({ "stage": stage, "reason": reason.as_str(), "abandoned": total }),
        );
        return Ok(PoolOutcome {
            results,
            stopped: Some(reason),
        });
    }

    let work = Arc::new(work);
    let cursor = Arc::new(AtomicUsize::new(0));
    let halt = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel::<(usize, Result<R, String>)>();

    let mut handles = Vec::new();
    for worker_idx in 0..resolve_workers(workers).min(total) {
        let items = Arc::clone(&items);
        let work = Arc::clone(&work);
        let cursor = Arc::clone(&cursor);
        let halt = Arc::clone(&halt);
        let tx = tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("rootcause-{stage}-{}", worker_idx + 1))
            .spawn(move || loop {
                if halt.load(Ordering::Acquire) {
                    break;
                }
                let idx = cursor.fetch_add(1, Ordering::AcqRel);
                let Some(item) = items.get(idx) else {
                    break;
                };
                let result = catch_unwind(AssertUnwindSafe(|| work(item))).map_err(panic_message);
                if tx.send((idx, result)).is_err() {
                    break;
                }
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => append_run_log(
                "warn",
                "worker_pool.spawn_failed",
                json!({ "stage": stage, "worker": worker_idx + 1, "error": e.to_string() }),
            ),
        }
    }
    drop(tx);
    if handles.is_empty() {
        return Err(RcaError::Io(format!("{stage}: no worker thread could be started")));
    }

    let mut received = 0usize;
    let mut stopped = None;
    while received < total {
        if cancel.is_cancelled() {
            stopped = Some(StopReason::Cancelled);
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            stopped = Some(StopReason::Deadline);
            break;
        }
        match rx.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
            Ok((idx, result)) => {
                results[idx] = Some(result);
                received += 1;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(reason) = stopped {
        halt.store(true, Ordering::Release);
        while let Ok((idx, result)) = rx.try_recv() {
            results[idx] = Some(result);
            received += 1;
        }
        append_run_log(
            "warn",
            "worker_pool.stopped",
            json!({
                "stage": stage,
                "reason": reason.as_str(),
                "completed": received,
                "abandoned": total - received,
            }),
        );
    } else {
        for handle in handles {
            let _ = handle.join();
        }
    }

    Ok(PoolOutcome { results, stopped })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return format!("worker panicked: {message}");
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return format!("worker panicked: {message}");
    }
    "worker panicked".to_string()
}
