// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Notifications emitted by a [`Pool`](crate::Pool).

use crate::job::JobOutcome;
use std::sync::mpsc::{channel, Receiver, Sender};

/// Consumer of the notifications of a [`Pool`](crate::Pool).
///
/// Callbacks run on the pool's worker threads (or on the thread calling
/// [`Pool::stop()`](crate::Pool::stop) when no worker is live), never while
/// the pool's internal lock is held. It is therefore fine to submit more jobs
/// from within a callback.
pub trait PoolObserver<J, T>: Send + Sync {
    /// Called once for every job that reached a worker and finished, whether
    /// successfully or not. Jobs dropped by the pool are never reported here.
    fn job_completed(&self, job: J, outcome: JobOutcome<T>);

    /// Called exactly once, after [`Pool::stop()`](crate::Pool::stop) and once
    /// all the workers have terminated.
    fn stopped(&self) {}
}

/// Notification forwarded by a [`ChannelObserver`].
#[derive(Debug)]
pub enum PoolEvent<J, T> {
    /// A job finished on a worker.
    Completed {
        /// The job that was executed.
        job: J,
        /// Result of the job.
        outcome: JobOutcome<T>,
    },
    /// The pool stopped: no more events will follow.
    Stopped,
}

/// A [`PoolObserver`] that forwards all notifications into a channel.
///
/// ```
/// # use loadpool::{ChannelObserver, FileLoader, ImageJob, Pool, PoolEvent, Size};
/// let (observer, events) = ChannelObserver::new();
/// let pool = Pool::new(Some(2), FileLoader::default(), observer);
///
/// pool.submit(ImageJob::new("/nonexistent.png", Size::new(64, 64)));
/// match events.recv().unwrap() {
///     PoolEvent::Completed { job, outcome } => {
///         assert_eq!(job.target_size, Size::new(64, 64));
///         assert!(outcome.is_err());
///     }
///     PoolEvent::Stopped => unreachable!(),
/// }
///
/// pool.stop();
/// assert!(matches!(events.recv().unwrap(), PoolEvent::Stopped));
/// ```
pub struct ChannelObserver<J, T> {
    sender: Sender<PoolEvent<J, T>>,
}

impl<J, T> ChannelObserver<J, T> {
    /// Creates an observer along with the receiving end of its channel.
    pub fn new() -> (Self, Receiver<PoolEvent<J, T>>) {
        let (sender, receiver) = channel();
        (Self { sender }, receiver)
    }
}

impl<J: Send, T: Send> PoolObserver<J, T> for ChannelObserver<J, T> {
    fn job_completed(&self, job: J, outcome: JobOutcome<T>) {
        // Nobody is listening anymore if the receiver was dropped.
        let _ = self.sender.send(PoolEvent::Completed { job, outcome });
    }

    fn stopped(&self) {
        let _ = self.sender.send(PoolEvent::Stopped);
    }
}
