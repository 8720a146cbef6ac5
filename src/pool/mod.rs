//! A pool of OS threads shared by named *roles*. Every role gets a slice of the thread budget
//!  between its minimum and maximum, and the pool periodically moves threads towards the roles
//!  whose workers are busiest.
//!
//! Workers run until their [CancelToken] is cancelled. A worker whose loop fails (returning an
//!  error or panicking) is logged and *not* restarted - restarting is the role's business, and
//!  none of the built-in roles do it.

mod rebalance;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::bail;
use parking_lot::Mutex;
use tracing::{debug, error, info, span, trace, Level};

use crate::config::{PoolConfig, ThreadRange};
use crate::util::cancel::CancelToken;
use crate::util::rate::RateSnapshot;
use crate::util::rolling_data::RollingData;
pub use rebalance::{plan_rebalance, RoleLoad};


/// A named responsibility that needs a dynamically scaled number of worker threads
pub trait Role: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn threads(&self) -> ThreadRange;

    /// The worker loop. It must return soon after `worker.cancel()` is cancelled; roles that
    ///  block in syscalls register a cancel callback that unblocks them.
    fn run_worker(&self, worker: &Worker) -> anyhow::Result<()>;

    /// called after all workers were joined
    fn dispose(&self) {}

    /// bytes and packets moved by all of the role's workers, for roles that move data
    fn throughput(&self) -> Option<RateSnapshot> {
        None
    }
}


/// Accumulated time that a role's workers spent doing actual work, in nanoseconds
#[derive(Default)]
struct Activity {
    active_nanos: AtomicU64,
}

pub struct Worker {
    role_name: String,
    index: usize,
    cancel: CancelToken,
    activity: Arc<Activity>,
}

impl Worker {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Marks the worker as busy until the returned guard is dropped. Time outside of these
    ///  spans counts as idle. The guard does not borrow the worker, so it can be moved into
    ///  work that outlives the current call.
    pub fn active(&self) -> ActiveGuard {
        ActiveGuard {
            activity: self.activity.clone(),
            start: Instant::now(),
        }
    }
}

pub struct ActiveGuard {
    activity: Arc<Activity>,
    start: Instant,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let nanos = self.start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.activity.active_nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}


struct WorkerHandle {
    cancel: CancelToken,
    join: JoinHandle<()>,
}

struct RoleSlot {
    role: Arc<dyn Role>,
    workers: Vec<WorkerHandle>,
    next_index: usize,
    activity: Arc<Activity>,
    history: RollingData<8>,
    last_sample: Instant,
    last_active_nanos: u64,
}


pub struct ThreadPool {
    config: PoolConfig,
    cancel: CancelToken,
    roles: Mutex<Vec<RoleSlot>>,
    rebalancer: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(config: PoolConfig) -> anyhow::Result<Arc<ThreadPool>> {
        config.validate()?;
        Ok(Arc::new(ThreadPool {
            config,
            cancel: CancelToken::new(),
            roles: Default::default(),
            rebalancer: Default::default(),
        }))
    }

    /// Registers a role and starts its minimum number of workers
    pub fn add_role(&self, role: Arc<dyn Role>) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            bail!("thread pool is disposed");
        }

        let range = role.threads();
        if range.min == 0 || range.min > range.max {
            bail!("role {} has an invalid thread range {:?}", role.name(), range);
        }

        let mut roles = self.roles.lock();
        if roles.iter().any(|r| r.role.name() == role.name()) {
            bail!("duplicate role {}", role.name());
        }
        let used: usize = roles.iter().map(|r| r.workers.len()).sum();
        if used + range.min > self.config.total_threads {
            bail!("no thread budget left for role {}: {} of {} threads in use, {} needed", role.name(), used, self.config.total_threads, range.min);
        }

        info!("starting role {} with {} threads", role.name(), range.min);
        let mut slot = RoleSlot {
            role,
            workers: Vec::new(),
            next_index: 0,
            activity: Default::default(),
            history: RollingData::new(),
            last_sample: Instant::now(),
            last_active_nanos: 0,
        };
        for _ in 0..range.min {
            self.spawn_worker(&mut slot)?;
        }
        roles.push(slot);
        Ok(())
    }

    fn spawn_worker(&self, slot: &mut RoleSlot) -> anyhow::Result<()> {
        let worker = Worker {
            role_name: slot.role.name().to_string(),
            index: slot.next_index,
            cancel: self.cancel.child_token(),
            activity: slot.activity.clone(),
        };
        slot.next_index += 1;

        let cancel = worker.cancel.clone();
        let role = slot.role.clone();
        let join = thread::Builder::new()
            .name(format!("{}-{}", worker.role_name, worker.index))
            .spawn(move || Self::worker_main(role, worker))?;

        slot.workers.push(WorkerHandle { cancel, join });
        Ok(())
    }

    fn worker_main(role: Arc<dyn Role>, worker: Worker) {
        let span = span!(Level::INFO, "worker", role = worker.role_name.as_str(), index = worker.index);
        let _entered = span.enter();

        debug!("worker started");
        match catch_unwind(AssertUnwindSafe(|| role.run_worker(&worker))) {
            Ok(Ok(())) => debug!("worker finished"),
            Ok(Err(e)) => error!("worker failed and will not be restarted: {:#}", e),
            Err(panic) => {
                let msg = panic.downcast_ref::<&str>().map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic>".to_string());
                error!("worker panicked and will not be restarted: {}", msg);
            }
        }
    }

    pub fn num_workers(&self, role_name: &str) -> usize {
        self.roles.lock()
            .iter()
            .find(|r| r.role.name() == role_name)
            .map(|r| r.workers.len())
            .unwrap_or(0)
    }

    /// number of a role's workers whose thread has not finished
    pub fn num_running_workers(&self, role_name: &str) -> usize {
        self.roles.lock()
            .iter()
            .find(|r| r.role.name() == role_name)
            .map(|r| r.workers.iter().filter(|w| !w.join.is_finished()).count())
            .unwrap_or(0)
    }

    /// total time the role's workers spent in [Worker::active] spans that have ended
    pub fn active_time(&self, role_name: &str) -> Option<Duration> {
        self.roles.lock()
            .iter()
            .find(|r| r.role.name() == role_name)
            .map(|r| Duration::from_nanos(r.activity.active_nanos.load(Ordering::Relaxed)))
    }

    pub fn throughput(&self, role_name: &str) -> Option<RateSnapshot> {
        let role = self.roles.lock()
            .iter()
            .find(|r| r.role.name() == role_name)
            .map(|r| r.role.clone())?;
        role.throughput()
    }

    /// Starts a background thread that rebalances at the configured interval until the pool
    ///  is disposed
    pub fn start_rebalancing(self: &Arc<Self>) -> anyhow::Result<()> {
        let pool = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.config.rebalance_interval;
        let join = thread::Builder::new()
            .name("pool-rebalancer".to_string())
            .spawn(move || {
                while !cancel.wait_timeout(interval) {
                    let Some(pool) = pool.upgrade() else {
                        break;
                    };
                    if let Err(e) = pool.rebalance() {
                        error!("rebalancing failed: {}", e);
                    }
                }
                trace!("rebalancer finished");
            })?;
        *self.rebalancer.lock() = Some(join);
        Ok(())
    }

    /// Samples every role's activity and moves threads according to [plan_rebalance]. Workers
    ///  that are scaled down are joined after the pool's lock is released.
    pub fn rebalance(&self) -> anyhow::Result<()> {
        let mut stopped = Vec::new();
        let result = self.do_rebalance(&mut stopped);

        for (role_name, w) in stopped {
            if w.join.join().is_err() {
                error!("worker of role {} panicked during shutdown", role_name);
            }
        }
        result
    }

    fn do_rebalance(&self, stopped: &mut Vec<(String, WorkerHandle)>) -> anyhow::Result<()> {
        let mut roles = self.roles.lock();
        let now = Instant::now();

        let mut loads = Vec::with_capacity(roles.len());
        for slot in roles.iter_mut() {
            let active_nanos = slot.activity.active_nanos.load(Ordering::Relaxed);
            let delta = active_nanos.saturating_sub(slot.last_active_nanos);
            let elapsed = now.duration_since(slot.last_sample).max(Duration::from_micros(1));
            let capacity = elapsed.as_nanos() as f64 * slot.workers.len().max(1) as f64;
            slot.history.add_value((delta as f64 / capacity).min(1.0));
            slot.last_active_nanos = active_nanos;
            slot.last_sample = now;

            loads.push(RoleLoad {
                threads: slot.workers.len(),
                range: slot.role.threads(),
                activity: slot.history.mean(),
            });
        }

        let targets = plan_rebalance(&loads, self.config.total_threads);
        for (slot, target) in roles.iter_mut().zip(targets) {
            let current = slot.workers.len();
            if target > current {
                debug!("scaling role {} up from {} to {} threads", slot.role.name(), current, target);
                for _ in current..target {
                    self.spawn_worker(slot)?;
                }
            }
            else if target < current {
                debug!("scaling role {} down from {} to {} threads", slot.role.name(), current, target);
                for w in slot.workers.split_off(target) {
                    w.cancel.cancel();
                    stopped.push((slot.role.name().to_string(), w));
                }
            }
        }
        Ok(())
    }

    /// Cancels all workers, joins them and disposes the roles
    pub fn dispose(&self) {
        self.cancel.cancel();
        if let Some(rebalancer) = self.rebalancer.lock().take() {
            let _ = rebalancer.join();
        }

        let roles = std::mem::take(&mut *self.roles.lock());
        for slot in roles {
            for w in slot.workers {
                if w.join.join().is_err() {
                    error!("worker of role {} panicked during shutdown", slot.role.name());
                }
            }
            slot.role.dispose();
            debug!("role {} disposed", slot.role.name());
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
