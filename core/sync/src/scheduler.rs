//! Background offline-queue processing: periodic and on reconnect.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use lifetrack_common::{Error, Result};

use crate::queue::{OfflineQueue, ProcessReport};

/// Requests accepted by the scheduler task.
#[derive(Debug)]
enum SchedulerRequest {
    /// Run a processing pass now and report the result.
    ProcessNow(oneshot::Sender<Result<ProcessReport>>),
    /// Stop the scheduler task.
    Shutdown,
}

/// Reports network reachability to the scheduler.
///
/// An offline → online transition triggers an immediate processing pass;
/// periodic passes are skipped while offline.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityHandle {
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Control side of the queue scheduler.
pub struct QueueScheduler {
    request_tx: mpsc::Sender<SchedulerRequest>,
    connectivity: ConnectivityHandle,
}

impl QueueScheduler {
    /// Create a scheduler processing `queue` every `period`.
    ///
    /// The returned handle must be run (usually spawned) for anything to
    /// happen. Connectivity starts out online.
    pub fn new(queue: Arc<OfflineQueue>, period: Duration) -> (Self, QueueSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let (connectivity_tx, connectivity_rx) = watch::channel(true);

        let scheduler = Self {
            request_tx,
            connectivity: ConnectivityHandle {
                tx: Arc::new(connectivity_tx),
            },
        };
        let handle = QueueSchedulerHandle {
            queue,
            period,
            request_rx,
            connectivity: connectivity_rx,
        };

        (scheduler, handle)
    }

    /// Handle for reporting connectivity changes.
    pub fn connectivity(&self) -> ConnectivityHandle {
        self.connectivity.clone()
    }

    /// Run a processing pass immediately, regardless of connectivity.
    ///
    /// # Errors
    /// `Shutdown` if the scheduler task is not running, otherwise whatever
    /// the pass itself returned.
    pub async fn process_now(&self) -> Result<ProcessReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send(SchedulerRequest::ProcessNow(response_tx))
            .await
            .map_err(|_| Error::Shutdown("Queue scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Shutdown("Queue scheduler stopped mid-pass".to_string()))?
    }

    /// Stop the scheduler task.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SchedulerRequest::Shutdown).await;
    }
}

/// Task side of the queue scheduler.
pub struct QueueSchedulerHandle {
    queue: Arc<OfflineQueue>,
    period: Duration,
    request_rx: mpsc::Receiver<SchedulerRequest>,
    connectivity: watch::Receiver<bool>,
}

impl QueueSchedulerHandle {
    /// Run until shutdown is requested or the [`QueueScheduler`] is dropped.
    pub async fn run(mut self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut was_online = *self.connectivity.borrow_and_update();

        info!("Queue scheduler started (every {:?})", self.period);

        loop {
            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some(SchedulerRequest::ProcessNow(response_tx)) => {
                        let report = self.queue.process_queue().await;
                        let _ = response_tx.send(report);
                    }
                    Some(SchedulerRequest::Shutdown) | None => {
                        info!("Queue scheduler shutting down");
                        break;
                    }
                },

                _ = ticker.tick() => {
                    if was_online {
                        debug!("Periodic queue pass");
                        self.run_pass().await;
                    } else {
                        debug!("Offline, skipping periodic queue pass");
                    }
                }

                changed = self.connectivity.changed() => {
                    if changed.is_err() {
                        info!("Connectivity source dropped, stopping queue scheduler");
                        break;
                    }
                    let online = *self.connectivity.borrow_and_update();
                    if online && !was_online {
                        info!("Connectivity restored, processing offline queue");
                        self.run_pass().await;
                    }
                    was_online = online;
                }
            }
        }
    }

    async fn run_pass(&self) {
        if let Err(e) = self.queue.process_queue().await {
            warn!("Offline queue pass not saved: {}", e);
        }
    }
}
