// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Recovery
//!
//! The `RecoverySupervisor` is a long lived task waiting for close notices of the
//! broker connection. On a notice for the live connection it enters recovery: sleep
//! the configured interval, reconnect, then run every registered `Restore` step (the
//! topology first, then the consumer subscriptions). A failed reconnect or restore is
//! retried after the same fixed interval, forever.
//!
//! The task ends when stopped through its handle (`Ok`), or when the notification
//! stream closes (`Err(AmqpError::NotificationChannelClosed)`), which is unrecoverable.

use crate::{connection::CloseNotice, errors::AmqpError, worker::stop_requested};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc::UnboundedReceiver, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

/// Reopens the broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reconnect: Send + Sync {
    async fn reconnect(&self) -> Result<(), AmqpError>;

    /// Generation of the live connection; close notices of older ones are ignored.
    fn generation(&self) -> u64;
}

/// A step re-run after every successful reconnect.
#[async_trait]
pub trait Restore: Send + Sync {
    fn name(&self) -> &str;

    async fn restore(&self) -> Result<(), AmqpError>;
}

pub struct RecoverySupervisor {
    recovery: Recovery,
    notices: UnboundedReceiver<CloseNotice>,
}

struct Recovery {
    connector: Arc<dyn Reconnect>,
    interval: Duration,
    restores: Vec<Arc<dyn Restore>>,
}

impl RecoverySupervisor {
    /// # Parameters
    /// * `connector` - Usually the `ConnectionManager`
    /// * `notices` - The manager close notifications
    /// * `interval` - Sleep before every reconnection attempt
    pub fn new(
        connector: Arc<dyn Reconnect>,
        notices: UnboundedReceiver<CloseNotice>,
        interval: Duration,
    ) -> RecoverySupervisor {
        RecoverySupervisor {
            recovery: Recovery {
                connector,
                interval,
                restores: vec![],
            },
            notices,
        }
    }

    /// Adds a restore step. Steps run in registration order.
    pub fn with_restore(mut self, restore: Arc<dyn Restore>) -> Self {
        self.recovery.restores.push(restore);
        self
    }

    /// Spawns the supervisor task.
    pub fn start(self) -> SupervisorHandle {
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(self.run(stopped));

        SupervisorHandle { stop, task }
    }

    async fn run(self, mut stopped: watch::Receiver<bool>) -> Result<(), AmqpError> {
        let RecoverySupervisor {
            recovery,
            mut notices,
        } = self;
        info!("recovery supervisor started");

        loop {
            let notice = tokio::select! {
                biased;
                _ = stop_requested(&mut stopped) => {
                    info!("recovery supervisor stopped");
                    return Ok(());
                }
                notice = notices.recv() => notice,
            };

            let Some(notice) = notice else {
                error!("close notification channel closed, recovery supervisor exiting");
                return Err(AmqpError::NotificationChannelClosed);
            };

            let live = recovery.connector.generation();
            if notice.generation != live {
                debug!(
                    generation = notice.generation,
                    live, "ignoring close notice of a replaced connection"
                );
                continue;
            }

            warn!(reason = %notice.reason, "amqp connection lost, recovering...");
            if !recovery.recover(&mut stopped).await {
                info!("recovery supervisor stopped");
                return Ok(());
            }
        }
    }
}

impl Recovery {
    /// Retries until reconnected and restored; false when stopped meanwhile.
    async fn recover(&self, stopped: &mut watch::Receiver<bool>) -> bool {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            tokio::select! {
                biased;
                _ = stop_requested(stopped) => return false,
                _ = sleep(self.interval) => {}
            }

            if let Err(err) = self.connector.reconnect().await {
                warn!(error = err.to_string(), attempt, "reconnection failed");
                continue;
            }

            match self.restore_all().await {
                Ok(()) => {
                    info!(attempt, "amqp connection recovered");
                    return true;
                }
                Err(err) => warn!(error = err.to_string(), attempt, "restore failed"),
            }
        }
    }

    async fn restore_all(&self) -> Result<(), AmqpError> {
        for restore in &self.restores {
            debug!(step = restore.name(), "restoring");
            restore.restore().await?;
        }
        Ok(())
    }
}

/// Lifecycle of a started supervisor.
pub struct SupervisorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<(), AmqpError>>,
}

impl SupervisorHandle {
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the supervisor to end and returns its outcome.
    pub async fn join(self) -> Result<(), AmqpError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                error!(error = err.to_string(), "recovery supervisor panicked");
                Err(AmqpError::InternalError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };
    use tokio::{sync::mpsc, time::Instant};

    const INTERVAL: Duration = Duration::from_secs(30);

    struct RecordingRestore {
        name: String,
        failures: AtomicUsize,
        calls: AtomicUsize,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingRestore {
        fn new(name: &str, failures: usize, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(RecordingRestore {
                name: name.to_owned(),
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                log,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Restore for RecordingRestore {
        fn name(&self) -> &str {
            &self.name
        }

        async fn restore(&self) -> Result<(), AmqpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(self.name.clone());

            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(AmqpError::DeclareExchangeError("tick-exchange".to_owned()));
            }
            Ok(())
        }
    }

    fn connector(generation: u64, failures: usize, attempts: Arc<AtomicUsize>) -> MockReconnect {
        let mut connector = MockReconnect::new();
        connector.expect_generation().return_const(generation);
        connector.expect_reconnect().returning(move || {
            if attempts.fetch_add(1, Ordering::SeqCst) < failures {
                Err(AmqpError::ConnectionError("connection refused".to_owned()))
            } else {
                Ok(())
            }
        });
        connector
    }

    fn notice(generation: u64) -> CloseNotice {
        CloseNotice {
            generation,
            reason: "CONNECTION_FORCED".to_owned(),
        }
    }

    async fn wait_for(restore: &RecordingRestore, calls: usize) {
        while restore.calls() < calls {
            sleep(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_at_fixed_interval_then_restores_in_order() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(vec![]));
        let topology = RecordingRestore::new("topology", 0, log.clone());
        let consumers = RecordingRestore::new("consumers", 0, log.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = RecoverySupervisor::new(Arc::new(connector(1, 2, attempts.clone())), rx, INTERVAL)
            .with_restore(topology.clone())
            .with_restore(consumers.clone())
            .start();

        let started = Instant::now();
        tx.send(notice(1)).unwrap();
        wait_for(&consumers, 1).await;

        assert!(started.elapsed() >= INTERVAL * 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(*log.lock().unwrap(), vec!["topology", "consumers"]);

        handle.stop();
        assert_eq!(handle.join().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_restore_triggers_a_new_attempt() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(vec![]));
        let topology = RecordingRestore::new("topology", 1, log.clone());
        let consumers = RecordingRestore::new("consumers", 0, log.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = RecoverySupervisor::new(Arc::new(connector(1, 0, attempts.clone())), rx, INTERVAL)
            .with_restore(topology.clone())
            .with_restore(consumers.clone())
            .start();

        tx.send(notice(1)).unwrap();
        wait_for(&consumers, 1).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(topology.calls(), 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["topology", "topology", "consumers"]
        );

        handle.stop();
        assert_eq!(handle.join().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_notice_is_ignored_and_closed_stream_is_fatal() {
        let mut connector = MockReconnect::new();
        connector.expect_generation().return_const(2u64);
        connector.expect_reconnect().never();
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = RecoverySupervisor::new(Arc::new(connector), rx, INTERVAL).start();

        tx.send(notice(1)).unwrap();
        drop(tx);

        assert_eq!(
            handle.join().await,
            Err(AmqpError::NotificationChannelClosed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_endless_recovery() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();

        let handle =
            RecoverySupervisor::new(Arc::new(connector(1, usize::MAX, attempts.clone())), rx, INTERVAL)
                .start();

        tx.send(notice(1)).unwrap();
        sleep(INTERVAL * 5 + Duration::from_secs(1)).await;
        assert!(attempts.load(Ordering::SeqCst) >= 4);
        assert!(!handle.is_finished());

        handle.stop();
        assert_eq!(handle.join().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_keeps_supervising() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(vec![]));
        let consumers = RecordingRestore::new("consumers", 0, log);
        let (tx, rx) = mpsc::unbounded_channel();

        drop(
            RecoverySupervisor::new(Arc::new(connector(1, 0, attempts.clone())), rx, INTERVAL)
                .with_restore(consumers.clone())
                .start(),
        );

        tx.send(notice(1)).unwrap();
        wait_for(&consumers, 1).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
