// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to load images through a worker pool.

use clap::{Parser, ValueEnum};
use loadpool::{
    Capacity, ChannelObserver, CpuPinningPolicy, FileLoader, FreeListOrder, ImageJob, JobError,
    JobOutcome, Loader, PoolBuilder, PoolEvent, Size, StopPolicy,
};
use rand::Rng;
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let builder = PoolBuilder {
        capacity: match cli.capacity {
            Some(capacity) => Capacity::Hint(capacity),
            None => Capacity::AvailableParallelism,
        },
        free_list_order: match cli.free_list_order {
            FreeListOrderCli::Fifo => FreeListOrder::Fifo,
            FreeListOrderCli::Lifo => FreeListOrder::Lifo,
        },
        stop_policy: match cli.stop_policy {
            StopPolicyCli::Abandon => StopPolicy::AbandonPending,
            StopPolicyCli::Drain => StopPolicy::DrainPending,
        },
        cpu_pinning: CpuPinningPolicy::IfSupported,
    };

    let jobs = if cli.paths.is_empty() {
        (0..cli.synthetic_jobs)
            .map(|i| ImageJob::new(format!("synthetic-{i}.jpg"), cli.target_size()))
            .collect::<Vec<_>>()
    } else {
        cli.paths
            .iter()
            .map(|path| ImageJob::new(path, cli.target_size()))
            .collect::<Vec<_>>()
    };

    let loader = DemoLoader {
        files: FileLoader {
            max_bytes: cli.max_bytes,
        },
        synthetic: cli.paths.is_empty(),
        max_latency: Duration::from_millis(cli.max_latency_ms),
    };
    let (observer, events) = ChannelObserver::new();
    let pool = builder.build(loader, observer);
    println!("Loading {} images with up to {} workers", jobs.len(), pool.capacity());

    let start = Instant::now();
    let num_jobs = jobs.len();
    for (i, job) in jobs.into_iter().enumerate() {
        if cli.stop_after == Some(i) {
            println!("Stopping after {i} submissions");
            pool.stop();
        }
        pool.submit(job);
    }
    if cli.stop_after.is_none() {
        // Wait for every submitted job before asking the pool to stop.
        let mut remaining = num_jobs;
        while remaining != 0 {
            match events.recv() {
                Ok(PoolEvent::Completed { job, outcome }) => {
                    report(&job, outcome);
                    remaining -= 1;
                }
                Ok(PoolEvent::Stopped) | Err(_) => break,
            }
        }
    }
    pool.stop();

    for event in events.iter() {
        match event {
            PoolEvent::Completed { job, outcome } => report(&job, outcome),
            PoolEvent::Stopped => break,
        }
    }
    println!("Pool stopped after {:?}: {:?}", start.elapsed(), pool.stats());
}

fn report(job: &ImageJob, outcome: JobOutcome<Vec<u8>>) {
    match outcome {
        Ok(data) => println!(
            "loaded {} ({} bytes) for display at {}",
            job.path.display(),
            data.len(),
            job.target_size
        ),
        Err(e) => println!("error: {e}"),
    }
}

/// Loader reading real files, or faking the work for synthetic jobs.
struct DemoLoader {
    files: FileLoader,
    synthetic: bool,
    max_latency: Duration,
}

impl Loader for DemoLoader {
    type Job = ImageJob;
    type Output = Vec<u8>;

    fn load(&self, job: &ImageJob) -> JobOutcome<Vec<u8>> {
        if !self.synthetic {
            return self.files.load(job);
        }

        let mut rng = rand::rng();
        let latency = rng.random_range(Duration::ZERO..=self.max_latency);
        std::thread::sleep(latency);
        if rng.random_bool(0.05) {
            return Err(JobError::Failed(format!(
                "{}: unsupported format",
                job.path.display()
            )));
        }
        let len = job.target_size.width as usize * job.target_size.height as usize * 4;
        Ok(vec![0; len])
    }
}

/// CLI tool to load images through a worker pool.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Image files to load. If empty, synthetic jobs are generated.
    paths: Vec<PathBuf>,

    /// Maximum number of workers. Default to the available parallelism.
    #[arg(long)]
    capacity: Option<usize>,

    /// Order in which idle workers are reused.
    #[arg(long, value_enum, default_value_t = FreeListOrderCli::Fifo)]
    free_list_order: FreeListOrderCli,

    /// What to do with queued jobs when stopping.
    #[arg(long, value_enum, default_value_t = StopPolicyCli::Abandon)]
    stop_policy: StopPolicyCli,

    /// Stop the pool before submitting the job at this index.
    #[arg(long)]
    stop_after: Option<usize>,

    /// Reject files larger than this many bytes.
    #[arg(long)]
    max_bytes: Option<u64>,

    /// Number of synthetic jobs, used when no path is given.
    #[arg(long, default_value_t = 32)]
    synthetic_jobs: usize,

    /// Maximum simulated latency of a synthetic job, in milliseconds.
    #[arg(long, default_value_t = 50)]
    max_latency_ms: u64,

    /// Width at which images are displayed.
    #[arg(long, default_value_t = 256)]
    width: u32,

    /// Height at which images are displayed.
    #[arg(long, default_value_t = 256)]
    height: u32,
}

impl Cli {
    fn target_size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

/// Order in which idle workers are reused.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum FreeListOrderCli {
    /// Reuse the worker idle for the longest time.
    Fifo,
    /// Reuse the most recently idle worker.
    Lifo,
}

/// What to do with queued jobs when stopping.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum StopPolicyCli {
    /// Drop the queued jobs.
    Abandon,
    /// Run the queued jobs before stopping.
    Drain,
}
