// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Pool
//!
//! Fixed-size pool of tasks pulling work from one bounded queue. Workers exit when the
//! queue is closed and drained, or as soon as `stop` is signalled; a job already
//! running always completes. Dropping the pool without `stop` leaves the workers
//! draining the queue. A panicking job is logged and its worker moves on.

use crate::errors::AmqpError;
use futures_util::FutureExt;
use std::{
    future::{self, Future},
    panic::AssertUnwindSafe,
    sync::Arc,
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error};

pub struct WorkerPool {
    stop: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers (at least one) running `job(worker_id, task)` for every
    /// task received on `tasks`.
    pub fn spawn<T, F, Fut>(size: usize, tasks: mpsc::Receiver<T>, job: F) -> WorkerPool
    where
        T: Send + 'static,
        F: Fn(usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, _) = watch::channel(false);
        let tasks = Arc::new(Mutex::new(tasks));
        let job = Arc::new(job);

        let workers = (0..size.max(1))
            .map(|id| {
                let tasks = tasks.clone();
                let job = job.clone();
                let mut stopped = stop.subscribe();

                tokio::spawn(async move {
                    loop {
                        let next = {
                            let mut rx = tasks.lock().await;
                            tokio::select! {
                                biased;
                                _ = stop_requested(&mut stopped) => None,
                                task = rx.recv() => task,
                            }
                        };

                        match next {
                            Some(task) => {
                                if AssertUnwindSafe(job(id, task)).catch_unwind().await.is_err() {
                                    error!(worker = id, "job panicked");
                                }
                            }
                            None => break,
                        }
                    }

                    debug!(worker = id, "worker exited");
                })
            })
            .collect();

        WorkerPool { stop, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Tells every worker to exit after its current job.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Waits for every worker to exit.
    pub async fn join(self) -> Result<(), AmqpError> {
        let mut result = Ok(());
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(error = err.to_string(), "worker panicked");
                result = Err(AmqpError::InternalError);
            }
        }
        result
    }
}

/// Resolves once `true` was sent. Never resolves after the sender is dropped.
pub(crate) async fn stop_requested(stopped: &mut watch::Receiver<bool>) {
    loop {
        if *stopped.borrow_and_update() {
            return;
        }
        if stopped.changed().await.is_err() {
            future::pending::<()>().await;
        }
    }
}
