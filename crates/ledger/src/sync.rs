//! Continuous sync worker
//!
//! Processes blocks until the source has none left, then waits for the
//! poll interval or a stop request, whichever comes first. Stop requests
//! are only observed between blocks.

use crate::processor::{BlockProcessor, SyncError};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};

/// Create a connected stop handle and signal
pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle(Arc::new(tx)), StopSignal(rx))
}

/// Requests a cooperative stop
#[derive(Clone, Debug)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Observes stop requests
#[derive(Clone, Debug)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Sleep up to `timeout`; true if a stop was requested meanwhile
    ///
    /// A dropped [`StopHandle`] counts as a stop request.
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => false,
            _ = self.0.wait_for(|stopped| *stopped) => true,
        }
    }
}

pub struct SyncWorker {
    processor: Arc<BlockProcessor>,
    poll_interval: Duration,
    stop: StopSignal,
}

impl SyncWorker {
    pub fn new(processor: Arc<BlockProcessor>, poll_interval: Duration, stop: StopSignal) -> Self {
        Self {
            processor,
            poll_interval,
            stop,
        }
    }

    /// Run until stopped or a fatal error; returns the number of blocks processed
    pub async fn run(mut self) -> Result<u64, SyncError> {
        let mut processed = 0u64;
        tracing::info!(
            "Sync worker started (poll every {}s)",
            self.poll_interval.as_secs()
        );

        'sync: while !self.stop.is_stopped() {
            match self.processor.refresh().await {
                Ok(_) => loop {
                    if self.stop.is_stopped() {
                        break 'sync;
                    }
                    match self.processor.next().await {
                        Ok(Some(_)) => processed += 1,
                        Ok(None) => break,
                        Err(e) if e.is_fatal() => {
                            tracing::error!("Sync worker stopping: {}", e);
                            return Err(e);
                        }
                        Err(e) => {
                            tracing::warn!("Block fetch failed, will retry: {}", e);
                            break;
                        }
                    }
                },
                Err(e) => tracing::warn!("Chain status unavailable, will retry: {}", e),
            }

            if self.stop.wait(self.poll_interval).await {
                break;
            }
        }

        tracing::info!("Sync worker stopped after {} blocks", processed);
        Ok(processed)
    }

    /// Run the worker on a tokio task
    pub fn spawn(processor: Arc<BlockProcessor>, poll_interval: Duration) -> SyncHandle {
        let (stop, signal) = stop_signal();
        let task = tokio::spawn(SyncWorker::new(processor, poll_interval, signal).run());
        SyncHandle { stop, task }
    }
}

/// Control side of a spawned [`SyncWorker`]
pub struct SyncHandle {
    stop: StopHandle,
    task: JoinHandle<Result<u64, SyncError>>,
}

impl SyncHandle {
    /// Ask the worker to stop after the block in flight
    pub fn request_stop(&self) {
        self.stop.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request a stop and wait for the worker to finish its block
    pub async fn stop(self) -> Result<u64, SyncError> {
        self.request_stop();
        self.join().await
    }

    pub async fn join(self) -> Result<u64, SyncError> {
        self.task
            .await
            .map_err(|e| SyncError::Worker(e.to_string()))?
    }
}
