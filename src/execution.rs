// =====================================================
// EXECUTION CONTROLLER
// =====================================================
//
// A named pool of OS threads fed by an unbounded FIFO queue. One controller
// runs the tasks of a job, another the sink workers of a task.

use crate::error::{Result, TransferError};
use crate::metrics::{MetricValue, MetricsSource};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Unit = Box<dyn FnOnce() + Send + 'static>;

/// How often an idle worker re-checks whether it should retire.
const IDLE_POLL: Duration = Duration::from_millis(50);

struct PoolState {
    name: String,
    queue: Receiver<Unit>,
    core_size: AtomicUsize,
    max_size: AtomicUsize,
    live: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    spawned: AtomicUsize,
}

impl PoolState {
    /// Claims a retirement slot when more workers are alive than allowed.
    fn try_retire(&self, idle: bool) -> bool {
        let mut live = self.live.load(Ordering::SeqCst);
        loop {
            let limit = if idle {
                self.core_size.load(Ordering::SeqCst)
            } else {
                self.max_size.load(Ordering::SeqCst)
            };
            if live <= limit {
                return false;
            }
            match self
                .live
                .compare_exchange(live, live - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => live = actual,
            }
        }
    }
}

pub struct ExecutionController {
    state: Arc<PoolState>,
    sender: Mutex<Option<Sender<Unit>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionController {
    pub fn new(name: &str, core_size: usize) -> Result<Self> {
        if core_size == 0 {
            return Err(TransferError::Config(format!(
                "Pool '{}' needs at least one thread",
                name
            )));
        }
        let (sender, queue) = crossbeam_channel::unbounded();
        Ok(Self {
            state: Arc::new(PoolState {
                name: name.to_string(),
                queue,
                core_size: AtomicUsize::new(core_size),
                max_size: AtomicUsize::new(core_size),
                live: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                spawned: AtomicUsize::new(0),
            }),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Queues a unit of work. Fails once the controller is shut down.
    pub fn submit<T, F>(&self, unit: F) -> Result<WorkHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let wrapped: Unit = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(unit));
            let _ = result_tx.send(outcome);
        });

        {
            let sender = self.sender.lock();
            let sender = sender.as_ref().ok_or_else(|| {
                TransferError::Execution(format!(
                    "Pool '{}' is shut down and rejects new work",
                    self.state.name
                ))
            })?;
            sender.send(wrapped).map_err(|_| {
                TransferError::Execution(format!("Pool '{}' has no queue", self.state.name))
            })?;
        }

        self.ensure_worker()?;
        Ok(WorkHandle {
            receiver: result_rx,
        })
    }

    /// Starts one worker when fewer than the core size are alive, or when
    /// every live worker is busy and the maximum allows another.
    fn ensure_worker(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        let live = self.state.live.load(Ordering::SeqCst);
        let core = self.state.core_size.load(Ordering::SeqCst);
        let max = self.state.max_size.load(Ordering::SeqCst);
        let saturated = self.state.active.load(Ordering::SeqCst) >= live;
        if live < core || (saturated && live < max && !self.state.queue.is_empty()) {
            workers.push(self.spawn_worker()?);
        }
        Ok(())
    }

    fn spawn_worker(&self) -> Result<JoinHandle<()>> {
        let state = Arc::clone(&self.state);
        let id = state.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        state.live.fetch_add(1, Ordering::SeqCst);
        thread::Builder::new()
            .name(format!("{}-{}", state.name, id))
            .spawn(move || worker_loop(state))
            .map_err(|e| {
                self.state.live.fetch_sub(1, Ordering::SeqCst);
                TransferError::Execution(format!(
                    "Failed to start worker thread for pool '{}': {}",
                    self.state.name, e
                ))
            })
    }

    pub fn core_pool_size(&self) -> usize {
        self.state.core_size.load(Ordering::SeqCst)
    }

    pub fn max_pool_size(&self) -> usize {
        self.state.max_size.load(Ordering::SeqCst)
    }

    /// Changes the core size; the maximum grows with it when needed.
    pub fn set_core_pool_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(TransferError::Config(
                "Core pool size must be at least 1".to_string(),
            ));
        }
        if size > self.max_pool_size() {
            self.state.max_size.store(size, Ordering::SeqCst);
        }
        self.state.core_size.store(size, Ordering::SeqCst);
        log::debug!("Pool '{}' core size set to {}", self.state.name, size);
        if !self.is_shutdown() {
            for _ in 0..self.queued_count() {
                self.ensure_worker()?;
            }
        }
        Ok(())
    }

    pub fn set_max_pool_size(&self, size: usize) -> Result<()> {
        if size == 0 || size < self.core_pool_size() {
            return Err(TransferError::Config(format!(
                "Maximum pool size {} must be at least the core size {}",
                size,
                self.core_pool_size()
            )));
        }
        self.state.max_size.store(size, Ordering::SeqCst);
        log::debug!("Pool '{}' maximum size set to {}", self.state.name, size);
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn completed_count(&self) -> u64 {
        self.state.completed.load(Ordering::SeqCst)
    }

    pub fn queued_count(&self) -> usize {
        self.state.queue.len()
    }

    pub fn live_threads(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stops accepting work. Already queued units still run.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            log::debug!("Pool '{}' shutting down", self.state.name);
        }
    }

    /// Waits for every worker to exit. Requires a prior `shutdown`.
    pub fn await_termination(&self) -> Result<()> {
        if !self.is_shutdown() {
            return Err(TransferError::Execution(format!(
                "Pool '{}' must be shut down before awaiting termination",
                self.state.name
            )));
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                log::error!("Worker of pool '{}' exited abnormally", self.state.name);
            }
        }
        Ok(())
    }
}

impl Drop for ExecutionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(state: Arc<PoolState>) {
    loop {
        if state.try_retire(false) {
            return;
        }
        match state.queue.recv_timeout(IDLE_POLL) {
            Ok(unit) => {
                state.active.fetch_add(1, Ordering::SeqCst);
                unit();
                state.active.fetch_sub(1, Ordering::SeqCst);
                state.completed.fetch_add(1, Ordering::SeqCst);
            }
            Err(RecvTimeoutError::Timeout) => {
                if state.try_retire(true) {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                state.live.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }
    }
}

impl MetricsSource for ExecutionController {
    fn snapshot(&self) -> Vec<(String, MetricValue)> {
        vec![
            ("corePoolSize".to_string(), self.core_pool_size().into()),
            ("maximumPoolSize".to_string(), self.max_pool_size().into()),
            ("poolSize".to_string(), self.live_threads().into()),
            ("activeCount".to_string(), self.active_count().into()),
            ("completedTaskCount".to_string(), self.completed_count().into()),
            ("queueSize".to_string(), self.queued_count().into()),
        ]
    }

    fn set(&self, property: &str, value: MetricValue) -> Result<()> {
        let size = value
            .as_integer()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| {
                TransferError::Config(format!("'{}' expects a positive integer", property))
            })?;
        match property {
            "corePoolSize" => self.set_core_pool_size(size),
            "maximumPoolSize" => self.set_max_pool_size(size),
            _ => Err(TransferError::Config(format!(
                "Metric property '{}' is read-only",
                property
            ))),
        }
    }
}

// --- Work Handle ---

/// Completion handle of a submitted unit.
pub struct WorkHandle<T> {
    receiver: Receiver<thread::Result<T>>,
}

impl<T> WorkHandle<T> {
    /// Blocks until the unit finished and returns its value.
    pub fn join(self) -> Result<T> {
        match self.receiver.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(TransferError::Execution(format!(
                "Work unit panicked: {}",
                panic_message(payload.as_ref())
            ))),
            Err(_) => Err(TransferError::Execution(
                "Work unit was dropped before it ran".to_string(),
            )),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
