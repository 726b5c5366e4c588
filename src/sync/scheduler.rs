//! Periodic and event-triggered queue drains.
//!
//! The scheduler drains once at startup, then on a fixed interval while
//! the network is reachable, and immediately whenever a caller asks
//! (typically right after an enqueue).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;

use super::{ProgressSink, SyncEngine};
use crate::error::{OutboxError, Result};

/// Commands for the retry scheduler.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Drain immediately, regardless of the timer.
    DrainNow,
    /// Stop the loop after one final drain.
    Stop,
}

/// Handle to the background retry loop.
pub struct RetryScheduler {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl RetryScheduler {
    /// Spawn the retry loop. Drains once immediately, then every `period`
    /// (reference: 5 minutes) while the connectivity probe reports
    /// reachable; a scheduled tick with no network is skipped silently.
    pub fn start(engine: Arc<SyncEngine>, sink: Arc<dyn ProgressSink>, period: Duration) -> Self {
        let (sender, mut receiver) = mpsc::channel::<SchedulerCommand>(16);

        tokio::spawn(async move {
            run_cycle(&engine, &sink).await;

            let mut tick = interval(period);
            tick.tick().await; // the first tick fires immediately

            loop {
                tokio::select! {
                    cmd = receiver.recv() => {
                        match cmd {
                            Some(SchedulerCommand::DrainNow) => {
                                run_cycle(&engine, &sink).await;
                            }
                            Some(SchedulerCommand::Stop) | None => {
                                // Final drain before stopping.
                                run_cycle(&engine, &sink).await;
                                break;
                            }
                        }
                    }
                    _ = tick.tick() => {
                        if engine.is_reachable().await {
                            run_cycle(&engine, &sink).await;
                        } else {
                            tracing::debug!("Scheduled drain skipped: network unreachable");
                        }
                    }
                }
            }

            tracing::info!("Retry scheduler stopped");
        });

        Self { sender }
    }

    /// Trigger a drain now (e.g. right after an enqueue).
    pub async fn drain_now(&self) -> Result<()> {
        self.sender
            .send(SchedulerCommand::DrainNow)
            .await
            .map_err(|_| OutboxError::Sync("Scheduler channel closed".to_string()))?;
        Ok(())
    }

    /// Stop the scheduler after one final drain.
    pub async fn stop(&self) -> Result<()> {
        self.sender
            .send(SchedulerCommand::Stop)
            .await
            .map_err(|_| OutboxError::Sync("Scheduler channel closed".to_string()))?;
        Ok(())
    }
}

async fn run_cycle(engine: &Arc<SyncEngine>, sink: &Arc<dyn ProgressSink>) {
    match engine.drain(sink.clone()).await {
        Ok(summary) => {
            tracing::info!(
                "Drain cycle: {} ({} succeeded, {} failed)",
                summary.message,
                summary.succeeded,
                summary.failed
            );
        }
        Err(e) => {
            // The loop survives; the next trigger retries.
            tracing::error!("Drain cycle failed: {}", e);
        }
    }
}
