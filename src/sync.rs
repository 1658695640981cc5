//! Drains the offline queue once connectivity returns.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::bridge::{ClientBridge, WorkerMessage};
use crate::config::{QueueConfig, MAX_DURATION_SECS};
use crate::network::{IncompleteResponse, Network};
use crate::queue::{MutationStatus, OfflineQueue, QueuedMutation};

/// Automatic retry budget for failed replays.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from_config(&QueueConfig::default())
  }
}

impl RetryPolicy {
  pub fn from_config(config: &QueueConfig) -> Self {
    Self {
      max_attempts: config.max_attempts.max(1),
      base_delay: Duration::seconds(config.base_delay_secs.min(MAX_DURATION_SECS) as i64),
      max_delay: Duration::seconds(config.max_delay_secs.min(MAX_DURATION_SECS) as i64),
    }
  }

  /// Delay before the next replay after `attempts` failures: doubles per
  /// failure, capped at `max_delay`.
  pub fn backoff(&self, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(30);
    let seconds = self
      .base_delay
      .num_seconds()
      .saturating_mul(1i64 << exponent);
    Duration::seconds(seconds.min(self.max_delay.num_seconds()))
  }

  /// Whether a drain starting at `now` should replay this mutation.
  pub fn is_due(&self, mutation: &QueuedMutation, now: DateTime<Utc>) -> bool {
    match mutation.status {
      MutationStatus::Pending => true,
      MutationStatus::Dead => false,
      MutationStatus::Failed => match mutation.last_attempt_at {
        Some(last) => now - last >= self.backoff(mutation.attempts),
        None => true,
      },
    }
  }

  pub fn is_exhausted(&self, attempts: u32) -> bool {
    attempts >= self.max_attempts
  }
}

/// Tally of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSession {
  pub total: usize,
  pub remaining: usize,
  pub succeeded: usize,
  pub failed: usize,
}

/// Result of asking for a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
  Completed(SyncSession),
  /// A drain was already in progress; this trigger was folded into it
  Coalesced,
}

/// Replays queued mutations in FIFO order, one at a time.
#[derive(Clone)]
pub struct SyncCoordinator {
  queue: OfflineQueue,
  network: Arc<dyn Network>,
  bridge: ClientBridge,
  policy: RetryPolicy,
  draining: Arc<AtomicBool>,
}

impl SyncCoordinator {
  pub fn new(
    queue: OfflineQueue,
    network: Arc<dyn Network>,
    bridge: ClientBridge,
    policy: RetryPolicy,
  ) -> Self {
    Self {
      queue,
      network,
      bridge,
      policy,
      draining: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::SeqCst)
  }

  /// Drain the queue.
  ///
  /// The set of mutations is fixed when the drain starts; anything enqueued
  /// later waits for the next drain. A failed replay is recorded and the
  /// drain moves on to the next item.
  pub async fn drain(&self) -> Result<DrainOutcome> {
    if self
      .draining
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      info!("Drain already in progress, coalescing trigger");
      return Ok(DrainOutcome::Coalesced);
    }
    let _idle = IdleOnDrop(&self.draining);

    let now = Utc::now();
    let snapshot: Vec<QueuedMutation> = self
      .queue
      .list_pending()?
      .into_iter()
      .filter(|m| self.policy.is_due(m, now))
      .collect();

    let mut session = SyncSession {
      total: snapshot.len(),
      remaining: snapshot.len(),
      ..SyncSession::default()
    };
    info!("Draining {} queued mutations", session.total);

    for mutation in snapshot {
      match self.replay(&mutation).await {
        Ok(()) => {
          self.queue.mark_succeeded(mutation.id)?;
          session.succeeded += 1;
        }
        Err(error) => {
          let attempts = self.queue.mark_failed(mutation.id, &error)?;
          if self.policy.is_exhausted(attempts) {
            warn!(
              "Mutation {} dead-lettered after {} attempts: {}",
              mutation.id, attempts, error
            );
            self.queue.dead_letter(mutation.id)?;
          } else {
            warn!("Replay of mutation {} failed: {}", mutation.id, error);
          }
          session.failed += 1;
        }
      }

      session.remaining -= 1;
      self.bridge.notify(WorkerMessage::SyncProgress {
        remaining: session.remaining,
      });
    }

    info!(
      "Drain complete: {} succeeded, {} failed",
      session.succeeded, session.failed
    );
    self.bridge.notify(WorkerMessage::SyncComplete {
      succeeded: session.succeeded,
      failed: session.failed,
    });

    Ok(DrainOutcome::Completed(session))
  }

  /// Replay one mutation. Only a 2xx answer counts as success.
  async fn replay(&self, mutation: &QueuedMutation) -> Result<(), String> {
    let request = mutation.to_request().map_err(|e| e.to_string())?;
    match self.network.fetch(request).await {
      Ok(response) if response.is_success() => Ok(()),
      Ok(response) => Err(format!("HTTP {}", response.status)),
      Err(e) => match e.downcast_ref::<IncompleteResponse>() {
        // Delivered; only the answer was cut short
        Some(incomplete) if (200..300).contains(&incomplete.status) => Ok(()),
        _ => Err(format!("{:#}", e)),
      },
    }
  }
}

/// Returns the coordinator to idle however the drain ends.
struct IdleOnDrop<'a>(&'a AtomicBool);

impl Drop for IdleOnDrop<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}
