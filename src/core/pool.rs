// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A bounded, elastic pool of workers.

use super::util::Status;
use super::worker::{Worker, WorkerContext, WorkerId};
use crate::job::{JobOutcome, Loader};
use crate::macros::{log_debug, log_error, log_trace, log_warn};
use crate::observer::PoolObserver;
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Maximum number of workers that a pool may run at the same time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capacity {
    /// Use the number returned by [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Use the given number.
    Hint(usize),
}

impl Capacity {
    /// Lower bound on the resolved capacity.
    pub const MIN: usize = 2;

    /// Resolves the capacity, which is never less than [`Capacity::MIN`].
    ///
    /// ```
    /// # use loadpool::Capacity;
    /// assert_eq!(Capacity::Hint(0).resolve(), 2);
    /// assert_eq!(Capacity::Hint(6).resolve(), 6);
    /// assert!(Capacity::AvailableParallelism.resolve() >= 2);
    /// ```
    pub fn resolve(self) -> usize {
        let capacity = match self {
            Capacity::AvailableParallelism => match std::thread::available_parallelism() {
                Ok(count) => count.get(),
                Err(_e) => {
                    log_warn!("Getting the available parallelism failed, using the minimum capacity: {_e}");
                    Self::MIN
                }
            },
            Capacity::Hint(hint) => hint,
        };
        capacity.max(Self::MIN)
    }
}

impl From<Option<usize>> for Capacity {
    fn from(hint: Option<usize>) -> Self {
        match hint {
            Some(hint) => Capacity::Hint(hint),
            None => Capacity::AvailableParallelism,
        }
    }
}

/// Order in which idle workers are reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreeListOrder {
    /// Reuse the worker that has been idle the longest.
    Fifo,
    /// Reuse the worker that became idle most recently.
    Lifo,
}

/// What happens to queued jobs when the pool is stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopPolicy {
    /// Jobs still waiting for a worker are dropped. Jobs already running on a
    /// worker finish normally.
    AbandonPending,
    /// Jobs still waiting for a worker are dispatched before the workers
    /// exit. Jobs submitted after the stop are dropped either way.
    DrainPending,
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin the worker in slot `i` to CPU `i % available_parallelism`, if CPU
    /// pinning is supported and implemented on this platform.
    IfSupported,
}

/// A builder for [`Pool`].
#[derive(Clone, Copy, Debug)]
pub struct PoolBuilder {
    /// Maximum number of live workers.
    pub capacity: Capacity,
    /// Order in which idle workers are reused.
    pub free_list_order: FreeListOrder,
    /// What happens to queued jobs when the pool is stopped.
    pub stop_policy: StopPolicy,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            capacity: Capacity::AvailableParallelism,
            free_list_order: FreeListOrder::Fifo,
            stop_policy: StopPolicy::AbandonPending,
            cpu_pinning: CpuPinningPolicy::No,
        }
    }
}

impl PoolBuilder {
    /// Creates a pool running jobs with the given loader and reporting to the
    /// given observer. No worker is spawned until the first job is submitted.
    ///
    /// ```
    /// # use loadpool::{Capacity, ChannelObserver, FileLoader, FreeListOrder, PoolBuilder};
    /// # use loadpool::{CpuPinningPolicy, StopPolicy};
    /// let (observer, _events) = ChannelObserver::new();
    /// let pool = PoolBuilder {
    ///     capacity: Capacity::Hint(4),
    ///     free_list_order: FreeListOrder::Fifo,
    ///     stop_policy: StopPolicy::DrainPending,
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build(FileLoader::default(), observer);
    ///
    /// assert_eq!(pool.capacity(), 4);
    /// assert_eq!(pool.stats().live_workers, 0);
    /// ```
    pub fn build<L: Loader>(
        &self,
        loader: L,
        observer: impl PoolObserver<L::Job, L::Output> + 'static,
    ) -> Pool<L> {
        Pool::from_builder(self, loader, Box::new(observer))
    }
}

/// Lifecycle phase of a [`Pool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolPhase {
    /// Jobs are accepted.
    Running,
    /// [`Pool::stop()`] was called, and some workers are still live.
    Draining,
    /// All the workers have terminated. This phase is final.
    Stopped,
}

/// Snapshot of the state of a [`Pool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum number of live workers.
    pub capacity: usize,
    /// Number of workers that haven't terminated yet.
    pub live_workers: usize,
    /// Number of live workers waiting for a job.
    pub idle_workers: usize,
    /// Number of live workers running a job.
    pub busy_workers: usize,
    /// Number of live workers that were asked to stop.
    pub stopping_workers: usize,
    /// Number of jobs waiting for a worker.
    pub pending_jobs: usize,
    /// Lifecycle phase of the pool.
    pub phase: PoolPhase,
}

/// A pool dispatching jobs to a bounded set of reusable worker threads.
///
/// Submitted jobs go, in order of preference, to an idle worker, to a newly
/// spawned worker if fewer than [`capacity()`](Self::capacity) are live, or
/// to a FIFO queue drained by workers as they finish their jobs. Neither
/// [`submit()`](Self::submit) nor [`stop()`](Self::stop) ever blocks on a
/// running job.
///
/// Results are delivered to the [`PoolObserver`] given at construction.
///
/// Dropping the pool stops it and blocks until all its workers have
/// terminated. Don't drop the pool from within one of its observer callbacks.
pub struct Pool<L: Loader> {
    shared: Arc<Shared<L>>,
}

impl<L: Loader> Pool<L> {
    /// Creates a pool with the given capacity hint and default settings for
    /// everything else. Without a hint, the available parallelism is used.
    pub fn new(
        capacity_hint: Option<usize>,
        loader: L,
        observer: impl PoolObserver<L::Job, L::Output> + 'static,
    ) -> Self {
        PoolBuilder {
            capacity: capacity_hint.into(),
            ..PoolBuilder::default()
        }
        .build(loader, observer)
    }

    fn from_builder(
        builder: &PoolBuilder,
        loader: L,
        observer: Box<dyn PoolObserver<L::Job, L::Output>>,
    ) -> Self {
        let capacity = builder.capacity.resolve();
        let pin_modulo = match builder.cpu_pinning {
            CpuPinningPolicy::No => None,
            CpuPinningPolicy::IfSupported => {
                #[cfg(any(
                    miri,
                    not(any(
                        target_os = "android",
                        target_os = "dragonfly",
                        target_os = "freebsd",
                        target_os = "linux"
                    ))
                ))]
                log_warn!("Pinning threads to CPUs is not implemented on this platform.");
                std::thread::available_parallelism()
                    .ok()
                    .map(|count| count.get())
            }
        };
        log_debug!("Creating a pool with a capacity of {capacity} workers");

        Self {
            shared: Arc::new(Shared {
                loader,
                observer,
                capacity,
                free_list_order: builder.free_list_order,
                stop_policy: builder.stop_policy,
                pin_modulo,
                stop: CachePadded::new(AtomicBool::new(false)),
                state: Status::new(PoolState {
                    slots: Vec::new(),
                    vacant: Vec::new(),
                    live: 0,
                    free: VecDeque::new(),
                    pending: VecDeque::new(),
                    phase: PoolPhase::Running,
                    stopped_notified: false,
                    finished: Vec::new(),
                }),
            }),
        }
    }

    /// Returns the maximum number of live workers in this pool.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Returns whether [`stop()`](Self::stop) was called on this pool.
    pub fn is_stopping(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the state of this pool.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let mut stats = PoolStats {
            capacity: self.shared.capacity,
            live_workers: state.live,
            idle_workers: 0,
            busy_workers: 0,
            stopping_workers: 0,
            pending_jobs: state.pending.len(),
            phase: state.phase,
        };
        for slot in state.slots.iter().flatten() {
            match slot.state {
                WorkerState::Idle => stats.idle_workers += 1,
                WorkerState::Busy => stats.busy_workers += 1,
                WorkerState::Stopping => stats.stopping_workers += 1,
            }
        }
        stats
    }

    /// Submits a job to the pool.
    ///
    /// The job runs on an idle worker if there is one, otherwise on a new
    /// worker if the pool isn't at capacity, otherwise it is queued until a
    /// worker becomes available. Once the pool is stopping, submitted jobs are
    /// silently dropped.
    pub fn submit(&self, job: L::Job) {
        if self.is_stopping() {
            log_debug!("Dropping a job submitted after stop()");
            return;
        }

        let mut state = self.shared.state.lock();
        // The stop flag is only ever set with the lock held.
        if self.is_stopping() {
            log_debug!("Dropping a job submitted after stop()");
            return;
        }
        if !state.pending.is_empty() {
            // Older jobs go first, even if a failed spawn left room for a
            // new worker.
            state.pending.push_back(job);
            while let Some(job) = state.pending.pop_front() {
                if let Some(job) = Shared::dispatch(&self.shared, &mut state, job) {
                    state.pending.push_front(job);
                    break;
                }
            }
            log_debug!("Queued a job, {} now pending", state.pending.len());
        } else if let Some(job) = Shared::dispatch(&self.shared, &mut state, job) {
            state.pending.push_back(job);
            log_debug!("Queued a job, {} now pending", state.pending.len());
        }
    }

    /// Stops the pool.
    ///
    /// New jobs are no longer accepted, queued jobs are handled according to
    /// the [`StopPolicy`], and every worker exits once its current job is done.
    /// The observer's [`stopped()`](PoolObserver::stopped) callback fires once
    /// the last worker has terminated, which is immediately (on this thread) if
    /// no worker is live.
    ///
    /// Calling this more than once has no further effect.
    pub fn stop(&self) {
        let abandoned;
        {
            let mut state = self.shared.state.lock();
            if self.shared.stop.swap(true, Ordering::AcqRel) {
                log_debug!("The pool is already stopping");
                return;
            }

            abandoned = match self.shared.stop_policy {
                StopPolicy::AbandonPending => std::mem::take(&mut state.pending),
                StopPolicy::DrainPending => VecDeque::new(),
            };
            if !abandoned.is_empty() {
                log_debug!("Abandoning {} pending jobs", abandoned.len());
            }

            if state.live != 0 {
                log_debug!("Stopping {} workers", state.live);
                state.phase = PoolPhase::Draining;
                state.free.clear();
                for slot in state.slots.iter_mut().flatten() {
                    slot.state = WorkerState::Stopping;
                    slot.worker.request_stop();
                }
                return;
            }
            state.phase = PoolPhase::Stopped;
        }
        drop(abandoned);

        log_debug!("No live workers, the pool is stopped");
        self.shared.notify_stopped();
    }

    /// Blocks until the observer has been notified that the pool stopped.
    ///
    /// This waits forever unless [`stop()`](Self::stop) is called.
    pub fn wait_until_stopped(&self) {
        let _guard = self.shared.state.wait_while(|state| !state.stopped_notified);
    }
}

impl<L: Loader> Drop for Pool<L> {
    fn drop(&mut self) {
        self.stop();
        log_debug!("Waiting for the workers to terminate...");
        self.wait_until_stopped();

        let finished = std::mem::take(&mut self.shared.state.lock().finished);
        let current = std::thread::current().id();
        log_debug!("Joining {} worker threads...", finished.len());
        for thread in finished {
            if thread.thread().id() == current {
                log_warn!("The pool was dropped from one of its own workers, not joining it");
                continue;
            }
            let _result = thread.join();
            match _result {
                Ok(_) => log_trace!("Worker thread joined with result: {_result:?}"),
                Err(_) => log_error!("Worker thread joined with result: {_result:?}"),
            }
        }
        log_debug!("All the workers have terminated.");
    }
}

/// State of the worker in a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    /// Waiting for a job, in the free list.
    Idle,
    /// Running a job.
    Busy,
    /// Asked to exit, possibly running one last job.
    Stopping,
}

/// A live worker and its state.
struct Slot<J> {
    worker: Worker<J>,
    state: WorkerState,
}

/// Bookkeeping of a pool. Only ever accessed with the lock held.
struct PoolState<J> {
    /// Arena of workers indexed by [`WorkerId`], grown up to `capacity`
    /// entries as workers are spawned.
    slots: Vec<Option<Slot<J>>>,
    /// Indices of the empty entries of `slots`.
    vacant: Vec<WorkerId>,
    /// Number of occupied slots.
    live: usize,
    /// Idle workers, oldest first.
    free: VecDeque<WorkerId>,
    /// Jobs waiting for a worker, oldest first.
    pending: VecDeque<J>,
    /// Lifecycle phase reported by [`Pool::stats()`].
    phase: PoolPhase,
    /// Whether the observer has returned from its `stopped()` callback.
    stopped_notified: bool,
    /// Threads of the removed workers, joined when the pool is dropped.
    finished: Vec<JoinHandle<()>>,
}

impl<J: Send + 'static> PoolState<J> {
    fn slot_mut(&mut self, id: WorkerId) -> Option<&mut Slot<J>> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Takes a worker from the free list.
    fn pop_free(&mut self, order: FreeListOrder) -> Option<WorkerId> {
        match order {
            FreeListOrder::Fifo => self.free.pop_front(),
            FreeListOrder::Lifo => self.free.pop_back(),
        }
    }

    /// Hands a job to the given worker, which must be live.
    fn assign(&mut self, id: WorkerId, job: J) {
        match self.slot_mut(id) {
            Some(slot) => {
                if slot.state == WorkerState::Idle {
                    slot.state = WorkerState::Busy;
                }
                slot.worker.assign(job);
            }
            None => log_error!("[{id}] Cannot assign a job to a terminated worker"),
        }
    }

    /// Puts a worker that finished its job on the free list.
    fn release(&mut self, id: WorkerId) {
        if let Some(slot) = self.slot_mut(id) {
            debug_assert_eq!(slot.state, WorkerState::Busy);
            slot.state = WorkerState::Idle;
            self.free.push_back(id);
        }
    }

    /// Removes a terminated worker from the pool.
    fn remove(&mut self, id: WorkerId) {
        if let Some(slot) = self.slots.get_mut(id.index()).and_then(Option::take) {
            self.live -= 1;
            self.free.retain(|&free| free != id);
            self.vacant.push(id);
            // Threads that already exited need no joining.
            self.finished.retain(|thread| !thread.is_finished());
            self.finished.push(slot.worker.into_thread());
        }
    }

    /// Reserves an empty slot for a new worker, if the pool isn't at capacity.
    /// The slot must be filled or handed back with [`Self::unreserve()`].
    fn reserve_slot(&mut self, capacity: usize) -> Option<WorkerId> {
        if let Some(id) = self.vacant.pop() {
            return Some(id);
        }
        if self.slots.len() < capacity {
            self.slots.push(None);
            return Some(WorkerId(self.slots.len() - 1));
        }
        None
    }

    /// Hands back a slot reserved for a worker that couldn't be spawned.
    fn unreserve(&mut self, id: WorkerId) {
        self.vacant.push(id);
    }
}

/// State shared between the [`Pool`] handle and its workers.
///
/// Every mutation of the [`PoolState`] happens with its lock held, whether it
/// originates from the caller (`submit()`, `stop()`) or from a worker
/// notification (`completed()`, `terminated()`). Observer callbacks are made
/// with the lock released.
struct Shared<L: Loader> {
    loader: L,
    observer: Box<dyn PoolObserver<L::Job, L::Output>>,
    capacity: usize,
    free_list_order: FreeListOrder,
    stop_policy: StopPolicy,
    /// Number of CPUs to spread pinned workers over, if pinning is enabled.
    pin_modulo: Option<usize>,
    /// Set once by `stop()`, with the state lock held.
    stop: CachePadded<AtomicBool>,
    state: Status<PoolState<L::Job>>,
}

impl<L: Loader> Shared<L> {
    /// Hands a job to an idle worker, or to a new worker if the pool has room
    /// for one. Returns the job if neither was possible.
    fn dispatch(
        shared: &Arc<Self>,
        state: &mut PoolState<L::Job>,
        job: L::Job,
    ) -> Option<L::Job> {
        if let Some(id) = state.pop_free(shared.free_list_order) {
            log_debug!("[{id}] Reusing idle worker");
            state.assign(id, job);
            return None;
        }

        let id = state.reserve_slot(shared.capacity)?;
        let pin_to_cpu = shared.pin_modulo.map(|modulo| id.index() % modulo);
        match Worker::spawn(id, job, shared.clone(), pin_to_cpu) {
            Ok(worker) => {
                let worker_state = if shared.stop.load(Ordering::Acquire) {
                    // Replacement worker while draining: it exits after this job.
                    worker.request_stop();
                    WorkerState::Stopping
                } else {
                    WorkerState::Busy
                };
                state.slots[id.index()] = Some(Slot {
                    worker,
                    state: worker_state,
                });
                state.live += 1;
                log_debug!("[{id}] New worker, {} live", state.live);
                None
            }
            Err(e) => {
                log_error!("[{id}] Failed to spawn a worker thread: {}", e.error);
                state.unreserve(id);
                Some(e.job)
            }
        }
    }

    /// Notifies the observer that the pool stopped, and wakes up the threads
    /// waiting for it.
    fn notify_stopped(&self) {
        self.observer.stopped();
        self.state.notify_with(|state| state.stopped_notified = true);
    }
}

impl<L: Loader> WorkerContext for Shared<L> {
    type Job = L::Job;
    type Output = L::Output;

    fn execute(&self, _id: WorkerId, job: &L::Job) -> JobOutcome<L::Output> {
        self.loader.load(job)
    }

    fn completed(&self, id: WorkerId, job: L::Job, outcome: JobOutcome<L::Output>) {
        self.observer.job_completed(job, outcome);

        let mut state = self.state.lock();
        let stopping = self.stop.load(Ordering::Acquire);
        if stopping && self.stop_policy == StopPolicy::AbandonPending {
            // The worker was asked to stop and will exit on its own.
            return;
        }
        match state.pending.pop_front() {
            Some(next) => {
                log_debug!("[{id}] Picking up a pending job, {} left", state.pending.len());
                state.assign(id, next);
            }
            None if !stopping => {
                log_debug!("[{id}] Now idle");
                state.release(id);
            }
            None => (),
        }
    }

    fn terminated(self: Arc<Self>, id: WorkerId) {
        let abandoned;
        {
            let mut state = self.state.lock();
            state.remove(id);
            log_debug!("[{id}] Terminated, {} live", state.live);

            if !self.stop.load(Ordering::Acquire) {
                log_warn!("[{id}] Worker exited while the pool is running");
            }
            // A worker only exits early by panicking. Replace it if jobs would
            // otherwise be stranded in the queue.
            let replace = !self.stop.load(Ordering::Acquire)
                || self.stop_policy == StopPolicy::DrainPending;
            if replace {
                if let Some(job) = state.pending.pop_front() {
                    if let Some(job) = Shared::dispatch(&self, &mut state, job) {
                        state.pending.push_front(job);
                    }
                }
            }

            if state.phase != PoolPhase::Draining || state.live != 0 {
                return;
            }
            abandoned = std::mem::take(&mut state.pending);
            if !abandoned.is_empty() {
                log_error!(
                    "No worker left to drain {} pending jobs, abandoning them",
                    abandoned.len()
                );
            }
            state.phase = PoolPhase::Stopped;
        }
        drop(abandoned);

        log_debug!("[{id}] Last worker terminated, the pool is stopped");
        self.notify_stopped();
    }
}
