// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod core;
mod job;
mod macros;
mod observer;

pub use crate::core::{
    Capacity, CpuPinningPolicy, FreeListOrder, Pool, PoolBuilder, PoolPhase, PoolStats,
    StopPolicy,
};
pub use job::{FileLoader, ImageJob, JobError, JobOutcome, Loader, Size};
pub use observer::{ChannelObserver, PoolEvent, PoolObserver};

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Jobs at or above this number make the loader panic.
    const CORRUPT: u64 = 1000;

    /// Loader whose jobs block until their gate is released, and which reports
    /// every job it starts along with the name of the worker thread.
    struct GatedLoader {
        gates: Mutex<HashMap<u64, Receiver<()>>>,
        started: Mutex<Sender<(u64, String)>>,
    }

    type Gates = HashMap<u64, Sender<()>>;
    type Events = Receiver<PoolEvent<u64, String>>;

    impl GatedLoader {
        /// Creates a loader where the given jobs are gated. Dropping the sender
        /// of a gate releases the job.
        fn new(gated: impl IntoIterator<Item = u64>) -> (Self, Gates, Receiver<(u64, String)>) {
            let mut senders = HashMap::new();
            let mut receivers = HashMap::new();
            for job in gated {
                let (sender, receiver) = std::sync::mpsc::channel();
                senders.insert(job, sender);
                receivers.insert(job, receiver);
            }
            let (started_sender, started) = std::sync::mpsc::channel();
            let loader = GatedLoader {
                gates: Mutex::new(receivers),
                started: Mutex::new(started_sender),
            };
            (loader, senders, started)
        }
    }

    impl Loader for GatedLoader {
        type Job = u64;
        type Output = String;

        fn load(&self, job: &u64) -> JobOutcome<String> {
            let thread = std::thread::current().name().unwrap_or_default().to_owned();
            let _ = self.started.lock().unwrap().send((*job, thread.clone()));

            let gate = self.gates.lock().unwrap().remove(job);
            if let Some(gate) = gate {
                // Returns once the sender is dropped.
                let _ = gate.recv();
            }

            if *job >= CORRUPT {
                panic!("corrupt image #{job}");
            }
            Ok(thread)
        }
    }

    fn build_pool(
        free_list_order: FreeListOrder,
        stop_policy: StopPolicy,
        capacity: usize,
        loader: GatedLoader,
    ) -> (Pool<GatedLoader>, Events) {
        let (observer, events) = ChannelObserver::new();
        let pool = PoolBuilder {
            capacity: Capacity::Hint(capacity),
            free_list_order,
            stop_policy,
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build(loader, observer);
        (pool, events)
    }

    fn release(gates: &mut Gates, job: u64) {
        drop(gates.remove(&job).unwrap());
    }

    fn next_start(started: &Receiver<(u64, String)>) -> (u64, String) {
        started.recv_timeout(TIMEOUT).unwrap()
    }

    /// Waits for the next completion, returning the job and the thread that
    /// ran it.
    fn next_completion(events: &Events) -> (u64, String) {
        match events.recv_timeout(TIMEOUT).unwrap() {
            PoolEvent::Completed { job, outcome } => (job, outcome.unwrap()),
            PoolEvent::Stopped => panic!("unexpected stop"),
        }
    }

    /// Collects the completed jobs until the stop notification, and checks that
    /// nothing follows it.
    fn completions_until_stopped(events: &Events) -> Vec<u64> {
        let mut completed = Vec::new();
        loop {
            match events.recv_timeout(TIMEOUT).unwrap() {
                PoolEvent::Completed { job, .. } => completed.push(job),
                PoolEvent::Stopped => break,
            }
        }
        assert!(matches!(
            events.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected)
        ));
        completed.sort();
        completed
    }

    /// Polls the pool until its stats satisfy the predicate.
    fn wait_for_stats(pool: &Pool<GatedLoader>, predicate: impl Fn(&PoolStats) -> bool) {
        let start = Instant::now();
        while !predicate(&pool.stats()) {
            assert!(
                start.elapsed() < TIMEOUT,
                "timed out, stats: {:?}",
                pool.stats()
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn assert_invariants(stats: &PoolStats) {
        assert!(stats.live_workers <= stats.capacity, "{stats:?}");
        if stats.pending_jobs != 0 {
            assert_eq!(stats.idle_workers, 0, "{stats:?}");
        }
    }

    macro_rules! expand_tests {
        ( $order:expr, ) => {};
        ( $order:expr, $case:ident, $( $others:tt )* ) => {
            #[test]
            fn $case() {
                $crate::test::$case($order);
            }

            expand_tests!($order, $($others)*);
        };
    }

    macro_rules! pool_tests {
        ( $mod:ident, $order:expr, $( $tests:tt )* ) => {
            mod $mod {
                use super::*;

                expand_tests!($order, $($tests)*);
            }
        };
    }

    macro_rules! all_pool_tests {
        ( $mod:ident, $order:expr ) => {
            pool_tests!(
                $mod,
                $order,
                test_capacity_is_never_exceeded,
                test_queued_jobs_run_in_fifo_order,
                test_idle_worker_is_reused,
                test_free_list_order,
                test_stop_without_workers,
                test_stop_waits_for_running_job,
                test_stop_abandons_pending_jobs,
                test_stop_drains_pending_jobs,
                test_submit_after_stop_is_dropped,
                test_stop_is_idempotent,
                test_job_panic_is_reported,
                test_observer_panic_replaces_worker,
                test_observer_panic_while_draining,
            );
        };
    }

    all_pool_tests!(fifo, FreeListOrder::Fifo);
    all_pool_tests!(lifo, FreeListOrder::Lifo);

    fn test_capacity_is_never_exceeded(order: FreeListOrder) {
        let (loader, mut gates, _started) = GatedLoader::new(0..20);
        let (pool, events) = build_pool(order, StopPolicy::AbandonPending, 3, loader);

        for job in 0..20 {
            pool.submit(job);
            assert_invariants(&pool.stats());
        }
        let stats = pool.stats();
        assert_eq!(stats.live_workers, 3);
        assert_eq!(stats.pending_jobs, 17);

        let mut threads = HashMap::new();
        for job in 0..20 {
            release(&mut gates, job);
            let (completed, thread) = next_completion(&events);
            threads.insert(completed, thread);
            assert_invariants(&pool.stats());
        }
        assert_eq!(threads.len(), 20);

        let mut distinct = threads.into_values().collect::<Vec<_>>();
        distinct.sort();
        distinct.dedup();
        assert!(distinct.len() <= 3, "{distinct:?}");

        pool.stop();
        pool.wait_until_stopped();
        assert!(completions_until_stopped(&events).is_empty());
    }

    fn test_queued_jobs_run_in_fifo_order(order: FreeListOrder) {
        let (loader, mut gates, started) = GatedLoader::new(0..5);
        let (pool, events) = build_pool(order, StopPolicy::AbandonPending, 2, loader);

        for job in 0..5 {
            pool.submit(job);
        }
        let stats = pool.stats();
        assert_eq!(stats.live_workers, 2);
        assert_eq!(stats.busy_workers, 2);
        assert_eq!(stats.pending_jobs, 3);

        let mut threads = HashMap::new();
        for _ in 0..2 {
            let (job, thread) = next_start(&started);
            threads.insert(job, thread);
        }
        assert_eq!(threads.len(), 2);
        assert_ne!(threads[&0], threads[&1]);

        // Each worker that frees up takes the oldest pending job.
        release(&mut gates, 0);
        assert_eq!(next_start(&started), (2, threads[&0].clone()));
        release(&mut gates, 1);
        assert_eq!(next_start(&started), (3, threads[&1].clone()));
        release(&mut gates, 2);
        assert_eq!(next_start(&started), (4, threads[&0].clone()));
        assert_eq!(pool.stats().pending_jobs, 0);

        drop(gates);
        let mut completed = (0..5).map(|_| next_completion(&events).0).collect::<Vec<_>>();
        completed.sort();
        assert_eq!(completed, [0, 1, 2, 3, 4]);

        pool.stop();
        assert!(completions_until_stopped(&events).is_empty());
    }

    fn test_idle_worker_is_reused(order: FreeListOrder) {
        let (loader, _gates, _started) = GatedLoader::new([]);
        let (pool, events) = build_pool(order, StopPolicy::AbandonPending, 4, loader);

        pool.submit(0);
        let (_, first_thread) = next_completion(&events);
        wait_for_stats(&pool, |stats| stats.idle_workers == 1);

        pool.submit(1);
        let (job, second_thread) = next_completion(&events);
        assert_eq!(job, 1);
        assert_eq!(first_thread, second_thread);
        assert_eq!(pool.stats().live_workers, 1);

        pool.stop();
        assert!(completions_until_stopped(&events).is_empty());
    }

    fn test_free_list_order(order: FreeListOrder) {
        let (loader, mut gates, started) = GatedLoader::new([0, 1]);
        let (pool, events) = build_pool(order, StopPolicy::AbandonPending, 2, loader);

        pool.submit(0);
        pool.submit(1);
        let mut threads = HashMap::new();
        for _ in 0..2 {
            let (job, thread) = next_start(&started);
            threads.insert(job, thread);
        }

        // The worker of job 0 becomes idle before the worker of job 1.
        release(&mut gates, 0);
        wait_for_stats(&pool, |stats| stats.idle_workers == 1);
        release(&mut gates, 1);
        wait_for_stats(&pool, |stats| stats.idle_workers == 2);

        pool.submit(2);
        let (job, thread) = next_start(&started);
        assert_eq!(job, 2);
        let expected = match order {
            FreeListOrder::Fifo => &threads[&0],
            FreeListOrder::Lifo => &threads[&1],
        };
        assert_eq!(&thread, expected);

        pool.stop();
        assert_eq!(completions_until_stopped(&events), [0, 1, 2]);
    }

    fn test_stop_without_workers(order: FreeListOrder) {
        let (loader, _gates, _started) = GatedLoader::new([]);
        let (pool, events) = build_pool(order, StopPolicy::AbandonPending, 2, loader);

        pool.stop();

        // Nothing to drain: the notification was delivered synchronously.
        assert!(matches!(events.try_recv(), Ok(PoolEvent::Stopped)));
        assert!(pool.is_stopping());
        assert_eq!(pool.stats().phase, PoolPhase::Stopped);
        pool.wait_until_stopped();
    }

    fn test_stop_waits_for_running_job(order: FreeListOrder) {
        let (loader, mut gates, started) = GatedLoader::new([0]);
        let (pool, events) = build_pool(order, StopPolicy::AbandonPending, 2, loader);

        pool.submit(0);
        assert_eq!(next_start(&started).0, 0);
        pool.stop();

        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        let stats = pool.stats();
        assert_eq!(stats.phase, PoolPhase::Draining);
        assert_eq!(stats.live_workers, 1);
        assert_eq!(stats.stopping_workers, 1);

        release(&mut gates, 0);
        assert_eq!(next_completion(&events).0, 0);
        assert!(matches!(
            events.recv_timeout(TIMEOUT),
            Ok(PoolEvent::Stopped)
        ));

        pool.wait_until_stopped();
        let stats = pool.stats();
        assert_eq!(stats.phase, PoolPhase::Stopped);
        assert_eq!(stats.live_workers, 0);
    }

    fn test_stop_abandons_pending_jobs(order: FreeListOrder) {
        let (loader, gates, started) = GatedLoader::new(0..5);
        let (pool, events) = build_pool(order, StopPolicy::AbandonPending, 2, loader);

        for job in 0..5 {
            pool.submit(job);
        }
        let mut running = vec![next_start(&started).0, next_start(&started).0];
        running.sort();
        assert_eq!(running, [0, 1]);

        pool.stop();
        assert_eq!(pool.stats().pending_jobs, 0);

        drop(gates);
        assert_eq!(completions_until_stopped(&events), [0, 1]);
        assert!(started.try_recv().is_err());
    }

    fn test_stop_drains_pending_jobs(order: FreeListOrder) {
        let (loader, gates, started) = GatedLoader::new(0..5);
        let (pool, events) = build_pool(order, StopPolicy::DrainPending, 2, loader);

        for job in 0..5 {
            pool.submit(job);
        }
        next_start(&started);
        next_start(&started);

        pool.stop();
        assert_eq!(pool.stats().pending_jobs, 3);
        pool.submit(5);
        assert_eq!(pool.stats().pending_jobs, 3);

        drop(gates);
        assert_eq!(completions_until_stopped(&events), [0, 1, 2, 3, 4]);
    }

    fn test_submit_after_stop_is_dropped(order: FreeListOrder) {
        let (loader, mut gates, started) = GatedLoader::new([0]);
        let (pool, events) = build_pool(order, StopPolicy::AbandonPending, 2, loader);

        pool.submit(0);
        next_start(&started);
        pool.stop();

        pool.submit(1);
        let stats = pool.stats();
        assert_eq!(stats.live_workers, 1);
        assert_eq!(stats.pending_jobs, 0);

        release(&mut gates, 0);
        assert_eq!(completions_until_stopped(&events), [0]);

        pool.submit(2);
        assert_eq!(pool.stats().live_workers, 0);
        assert!(started.try_recv().is_err());
    }

    fn test_stop_is_idempotent(order: FreeListOrder) {
        let (loader, mut gates, started) = GatedLoader::new([0]);
        let (pool, events) = build_pool(order, StopPolicy::AbandonPending, 2, loader);

        pool.submit(0);
        next_start(&started);
        pool.stop();
        pool.stop();

        release(&mut gates, 0);
        pool.wait_until_stopped();
        pool.stop();

        assert_eq!(completions_until_stopped(&events), [0]);
        assert_eq!(pool.stats().phase, PoolPhase::Stopped);
    }

    fn test_job_panic_is_reported(order: FreeListOrder) {
        let (loader, _gates, _started) = GatedLoader::new([]);
        let (pool, events) = build_pool(order, StopPolicy::AbandonPending, 2, loader);

        pool.submit(CORRUPT);
        match events.recv_timeout(TIMEOUT).unwrap() {
            PoolEvent::Completed {
                job,
                outcome: Err(JobError::Panicked(message)),
            } => {
                assert_eq!(job, CORRUPT);
                assert_eq!(message, "corrupt image #1000");
            }
            e => panic!("unexpected event: {e:?}"),
        }

        // The worker survived.
        wait_for_stats(&pool, |stats| stats.idle_workers == 1);
        pool.submit(1);
        assert_eq!(next_completion(&events).0, 1);
        assert_eq!(pool.stats().live_workers, 1);

        pool.stop();
        assert!(completions_until_stopped(&events).is_empty());
    }

    /// Observer that panics upon the completion of one specific job.
    struct PanickingObserver {
        inner: ChannelObserver<u64, String>,
        panic_on: u64,
    }

    impl PoolObserver<u64, String> for PanickingObserver {
        fn job_completed(&self, job: u64, outcome: JobOutcome<String>) {
            if job == self.panic_on {
                panic!("observer failure on job #{job}");
            }
            self.inner.job_completed(job, outcome);
        }

        fn stopped(&self) {
            self.inner.stopped();
        }
    }

    fn test_observer_panic_replaces_worker(order: FreeListOrder) {
        let (loader, mut gates, started) = GatedLoader::new([7, 1, 2]);
        let (inner, events) = ChannelObserver::new();
        let pool = PoolBuilder {
            capacity: Capacity::Hint(2),
            free_list_order: order,
            stop_policy: StopPolicy::AbandonPending,
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build(loader, PanickingObserver { inner, panic_on: 7 });

        pool.submit(7);
        pool.submit(1);
        pool.submit(2);
        next_start(&started);
        next_start(&started);
        assert_eq!(pool.stats().pending_jobs, 1);

        // The worker running job 7 dies, and a new worker takes over the
        // pending job.
        release(&mut gates, 7);
        assert_eq!(next_start(&started).0, 2);
        let stats = pool.stats();
        assert_eq!(stats.live_workers, 2);
        assert_eq!(stats.pending_jobs, 0);

        release(&mut gates, 1);
        release(&mut gates, 2);
        let mut completed = vec![next_completion(&events).0, next_completion(&events).0];
        completed.sort();
        assert_eq!(completed, [1, 2]);

        pool.stop();
        assert!(completions_until_stopped(&events).is_empty());
    }

    fn test_observer_panic_while_draining(order: FreeListOrder) {
        let (loader, mut gates, started) = GatedLoader::new([7, 1]);
        let (inner, events) = ChannelObserver::new();
        let pool = PoolBuilder {
            capacity: Capacity::Hint(2),
            free_list_order: order,
            stop_policy: StopPolicy::DrainPending,
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build(loader, PanickingObserver { inner, panic_on: 7 });

        for job in [7, 1, 2, 3] {
            pool.submit(job);
        }
        next_start(&started);
        next_start(&started);

        pool.stop();
        let stats = pool.stats();
        assert_eq!(stats.phase, PoolPhase::Draining);
        assert_eq!(stats.pending_jobs, 2);

        // The worker running job 7 dies, and a new worker keeps draining the
        // queue.
        release(&mut gates, 7);
        assert_eq!(next_start(&started).0, 2);

        release(&mut gates, 1);
        assert_eq!(completions_until_stopped(&events), [1, 2, 3]);

        pool.wait_until_stopped();
        let stats = pool.stats();
        assert_eq!(stats.phase, PoolPhase::Stopped);
        assert_eq!(stats.live_workers, 0);
        assert_eq!(stats.pending_jobs, 0);
    }
}
