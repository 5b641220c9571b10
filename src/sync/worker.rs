//! Background sync worker
//!
//! Owns the three drain triggers: the connectivity signal (debounced by a
//! settle delay so flaky reconnects do not thrash), explicit manual
//! requests, and a periodic poll while online.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant};

use super::engine::SyncEngine;
use crate::error::{Result, SyncError};
use crate::types::DrainReason;

/// Commands accepted by the sync worker
#[derive(Debug)]
pub enum SyncCommand {
    /// Drain now, regardless of connectivity state
    Drain,
    /// Connectivity signal changed
    SetOnline(bool),
    /// Final drain, then stop the worker
    Stop,
}

/// Handle for feeding the worker from the host application
#[derive(Clone)]
pub struct SyncHandle {
    sender: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    /// Explicit manual drain request
    pub async fn sync_now(&self) -> Result<()> {
        self.send(SyncCommand::Drain).await
    }

    /// Feed the online/offline signal
    pub async fn set_online(&self, online: bool) -> Result<()> {
        self.send(SyncCommand::SetOnline(online)).await
    }

    /// Stop the worker after a final drain
    pub async fn stop(&self) -> Result<()> {
        self.send(SyncCommand::Stop).await
    }

    async fn send(&self, cmd: SyncCommand) -> Result<()> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| SyncError::WorkerGone)
    }
}

/// The background worker task
pub struct SyncWorker;

impl SyncWorker {
    /// Spawn the worker. The returned handle is the only way to reach it;
    /// dropping every handle stops the task.
    pub fn start(engine: Arc<SyncEngine>) -> SyncHandle {
        let (sender, mut receiver) = mpsc::channel::<SyncCommand>(100);
        let settle = engine.config().settle_delay;
        let poll = engine.config().poll_interval;

        tokio::spawn(async move {
            let mut online = false;
            // Armed on an offline-to-online transition; the drain fires
            // once the settle delay has passed without going offline again
            let mut reconnect_due: Option<Instant> = None;
            let mut next_poll = Instant::now() + poll;
            let mut check = interval(Duration::from_millis(250));

            loop {
                tokio::select! {
                    cmd = receiver.recv() => match cmd {
                        Some(SyncCommand::Drain) => {
                            let _ = engine.drain(DrainReason::Manual).await;
                        }
                        Some(SyncCommand::SetOnline(now_online)) => {
                            if now_online && !online {
                                reconnect_due = Some(Instant::now() + settle);
                                tracing::debug!("back online, drain armed");
                            } else if !now_online {
                                reconnect_due = None;
                            }
                            online = now_online;
                        }
                        Some(SyncCommand::Stop) => {
                            if online {
                                let _ = engine.drain(DrainReason::Shutdown).await;
                            }
                            break;
                        }
                        None => break,
                    },
                    _ = check.tick() => {
                        if let Some(due) = reconnect_due {
                            if Instant::now() >= due {
                                reconnect_due = None;
                                next_poll = Instant::now() + poll;
                                let _ = engine.drain(DrainReason::Reconnect).await;
                            }
                        } else if online && Instant::now() >= next_poll {
                            next_poll = Instant::now() + poll;
                            let _ = engine.drain(DrainReason::Poll).await;
                        }
                    }
                }
            }

            tracing::info!("sync worker stopped");
        });

        SyncHandle { sender }
    }
}
