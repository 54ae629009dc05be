// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Jobs, their outcomes, and the backend that executes them.

use std::any::Any;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use thiserror::Error;

/// Result of executing one job on a worker.
pub type JobOutcome<T> = Result<T, JobError>;

/// Error reported when a job fails on a worker.
///
/// A failing job never takes its worker down: the error is delivered to the
/// observer alongside the job.
#[derive(Debug, Error)]
pub enum JobError {
    /// Reading the image source failed.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Path of the image that couldn't be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The image source exceeds the configured size limit.
    #[error("{} is {size} bytes, over the limit of {limit} bytes", path.display())]
    TooLarge {
        /// Path of the oversized image.
        path: PathBuf,
        /// Size of the image, in bytes.
        size: u64,
        /// Configured limit, in bytes.
        limit: u64,
    },
    /// The loader reported a failure of its own.
    #[error("{0}")]
    Failed(String),
    /// The loader panicked while executing the job.
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Builds a [`JobError::Panicked`] from a payload caught by
    /// [`std::panic::catch_unwind()`].
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        JobError::Panicked(message)
    }
}

/// Execution backend run by the workers of a [`Pool`](crate::Pool).
///
/// A single loader is shared by all the workers of a pool, and each worker
/// calls [`load()`](Self::load) for one job at a time. The call may block for
/// as long as it needs: it only occupies its own worker thread.
pub trait Loader: Send + Sync + 'static {
    /// Unit of work submitted to the pool.
    type Job: Send + 'static;
    /// Value produced by a successful job.
    type Output: Send + 'static;

    /// Executes the given job.
    fn load(&self, job: &Self::Job) -> JobOutcome<Self::Output>;
}

/// Dimensions of an image, in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Size {
    /// Creates a new size.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A request to load one image, to be displayed at the given size.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageJob {
    /// Location of the image data.
    pub path: PathBuf,
    /// Size at which the image will be displayed.
    pub target_size: Size,
}

impl ImageJob {
    /// Creates a new image job.
    pub fn new(path: impl Into<PathBuf>, target_size: Size) -> Self {
        Self {
            path: path.into(),
            target_size,
        }
    }
}

/// A [`Loader`] that reads the raw bytes of each [`ImageJob`] from the file
/// system.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileLoader {
    /// Files larger than this many bytes are rejected with
    /// [`JobError::TooLarge`].
    pub max_bytes: Option<u64>,
}

impl Loader for FileLoader {
    type Job = ImageJob;
    type Output = Vec<u8>;

    fn load(&self, job: &ImageJob) -> JobOutcome<Vec<u8>> {
        let io_error = |source| JobError::Io {
            path: job.path.clone(),
            source,
        };

        let mut file = std::fs::File::open(&job.path).map_err(io_error)?;
        let size = file.metadata().map_err(io_error)?.len();
        if let Some(limit) = self.max_bytes {
            if size > limit {
                return Err(JobError::TooLarge {
                    path: job.path.clone(),
                    size,
                    limit,
                });
            }
        }

        let mut data = Vec::with_capacity(size as usize);
        file.read_to_end(&mut data).map_err(io_error)?;
        Ok(data)
    }
}
