//! Dead-letter reclamation
//!
//! Each tick, at most one runner per stream (advisory lock) looks at one page
//! of the pending entries list and reclaims the most idle entry if it has been
//! idle longer than `dead_letter_idle`:
//!
//! - never started by a worker (no received marker): re-added as a fresh entry
//! - started but never acknowledged: written to the log as a dead letter
//! - logged but the ack failed (settled marker): cleared, nothing is logged again
//!
//! Either way the original entry is acknowledged and deleted.

use crate::alert::{Alert, AlertKind};
use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::keys;
use crate::message::{Message, Status};
use crate::metrics::BrokerMetrics;
use crate::policy::DeliveryPolicy;
use crate::result::ProcessResult;
use crate::scripts;
use crate::stream::{PendingEntry, Progress, RouteStream};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pending entries inspected per tick
const PENDING_PAGE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Another runner holds the tick lock
    LockBusy,
    /// Nothing pending
    Empty,
    /// The most idle entry is still within the threshold
    NotIdle { id: String, idle: Duration },
    /// Re-added under a new id
    Requeued { id: String, new_id: String },
    /// Moved to the dead-letter log
    DeadLettered { id: String },
    /// Entry body was trimmed or undecodable; only the pending slot was cleared
    Dropped { id: String },
    /// Already processed and logged; the missing ack was completed
    Cleared { id: String },
}

pub struct DeadLetterReclaimer {
    ctx: BrokerContext,
    stream: RouteStream,
    policy: Arc<dyn DeliveryPolicy>,
    lock_key: String,
    token: String,
    metrics: BrokerMetrics,
}

impl DeadLetterReclaimer {
    pub fn new(
        ctx: BrokerContext,
        policy: Arc<dyn DeliveryPolicy>,
        channel: &str,
        topic: &str,
    ) -> Self {
        let mode = policy.mode();
        let stream_key = ctx.keys().stream(mode, channel, topic);
        let stream = RouteStream::new(ctx.redis(), stream_key.clone(), keys::group_name(channel));

        Self {
            lock_key: keys::dead_letter_lock_key(&stream_key),
            token: Uuid::new_v4().to_string(),
            metrics: BrokerMetrics::new(stream_key, mode.as_str()),
            ctx,
            stream,
            policy,
        }
    }

    /// Random tick within the configured range, so runners drift apart
    fn next_tick(&self) -> Duration {
        let (min, max) = self.ctx.config().dead_letter_tick;
        let (min_ms, max_ms) = (min.as_millis() as u64, max.as_millis() as u64);
        if max_ms <= min_ms {
            return min;
        }
        Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        info!(stream = %self.stream.stream(), "Starting dead-letter reclaimer");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(self.next_tick()) => {}
            }

            match self.tick().await {
                Ok(outcome) => {
                    debug!(stream = %self.stream.stream(), outcome = ?outcome, "Reclaim tick")
                }
                Err(e) => {
                    warn!(stream = %self.stream.stream(), error = %e, "Reclaim tick failed")
                }
            }
        }

        info!(stream = %self.stream.stream(), "Dead-letter reclaimer stopped");
        Ok(())
    }

    /// One guarded reclaim pass
    pub async fn tick(&self) -> Result<ReclaimOutcome, BrokerError> {
        let mut conn = self.ctx.conn();
        let ttl = self.ctx.config().advisory_lock_ttl;

        if !scripts::acquire_advisory_lock(&mut conn, &self.lock_key, &self.token, ttl).await? {
            return Ok(ReclaimOutcome::LockBusy);
        }

        let outcome = self.reclaim_one().await;

        if let Err(e) =
            scripts::release_advisory_lock(&mut conn, &self.lock_key, &self.token).await
        {
            // The TTL frees it anyway
            warn!(lock = %self.lock_key, error = %e, "Failed to release reclaim lock");
        }

        outcome
    }

    async fn reclaim_one(&self) -> Result<ReclaimOutcome, BrokerError> {
        let pending = self.stream.pending(PENDING_PAGE).await?;
        self.metrics.pending_count(pending.len());

        let Some(candidate) = most_idle(pending) else {
            return Ok(ReclaimOutcome::Empty);
        };

        if candidate.idle <= self.ctx.config().dead_letter_idle {
            return Ok(ReclaimOutcome::NotIdle {
                id: candidate.id,
                idle: candidate.idle,
            });
        }

        let id = candidate.id;
        let progress = self.stream.progress(&id).await?;

        if progress == Progress::Settled {
            self.stream.ack_and_delete(std::slice::from_ref(&id)).await?;
            info!(
                stream = %self.stream.stream(),
                stream_id = %id,
                "Completed ack of an already settled entry"
            );
            return Ok(ReclaimOutcome::Cleared { id });
        }

        let Some(raw) = self.stream.entry(&id).await? else {
            warn!(
                stream = %self.stream.stream(),
                stream_id = %id,
                "Pending entry has no body, clearing it"
            );
            self.stream.ack_and_delete(std::slice::from_ref(&id)).await?;
            return Ok(ReclaimOutcome::Dropped { id });
        };

        let mut message = match Message::from_fields(&raw.id, &raw.fields) {
            Ok(message) => message,
            Err(e) => {
                let record = ProcessResult::decode_error(
                    self.stream.stream(),
                    &id,
                    raw.job().unwrap_or_default(),
                    &e.to_string(),
                );
                self.ctx.process_log().add_log(&record).await?;
                self.stream.ack_and_delete(std::slice::from_ref(&id)).await?;
                self.metrics.decode_failed();
                return Ok(ReclaimOutcome::Dropped { id });
            }
        };

        if progress == Progress::Published {
            message.status = Status::Published;
            let new_id = self.stream.add(&message.encode()?).await?;
            self.stream.ack_and_delete(std::slice::from_ref(&id)).await?;
            self.metrics.message_requeued();

            info!(
                stream = %self.stream.stream(),
                stream_id = %id,
                new_id = %new_id,
                message_id = %message.id,
                idle_ms = candidate.idle.as_millis() as u64,
                "Requeued message that was never started"
            );
            return Ok(ReclaimOutcome::Requeued { id, new_id });
        }

        let idle_ms = candidate.idle.as_millis() as u64;
        let record = ProcessResult::dead_letter(&message, self.stream.stream(), &id, idle_ms);
        self.ctx.process_log().add_log(&record).await?;
        self.stream.ack_and_delete(std::slice::from_ref(&id)).await?;
        self.metrics.message_dead_lettered();

        message.status = Status::DeadLetter;
        if let Err(e) = self.policy.on_settled(&message, &record).await {
            error!(message_id = %message.id, error = %e, "Settle hook failed for dead letter");
        }

        self.ctx.alert(
            Alert::new(
                AlertKind::DeadLetter,
                self.stream.stream(),
                format!("message idle for {}ms without acknowledgement", idle_ms),
            )
            .with_message_id(&message.id),
        );

        warn!(
            stream = %self.stream.stream(),
            stream_id = %id,
            message_id = %message.id,
            idle_ms,
            "Moved message to dead-letter log"
        );
        Ok(ReclaimOutcome::DeadLettered { id })
    }
}

/// The entry with the largest idle time; the first one wins ties
fn most_idle(pending: Vec<PendingEntry>) -> Option<PendingEntry> {
    pending
        .into_iter()
        .reduce(|best, next| if next.idle > best.idle { next } else { best })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, idle_ms: u64) -> PendingEntry {
        PendingEntry {
            id: id.to_string(),
            consumer: "c".to_string(),
            idle: Duration::from_millis(idle_ms),
            deliveries: 1,
        }
    }

    #[test]
    fn test_most_idle_picks_largest() {
        let picked = most_idle(vec![entry("1-0", 10), entry("2-0", 500), entry("3-0", 20)]);
        assert_eq!(picked.unwrap().id, "2-0");
    }

    #[test]
    fn test_most_idle_prefers_first_on_tie() {
        let picked = most_idle(vec![entry("1-0", 50), entry("2-0", 50)]);
        assert_eq!(picked.unwrap().id, "1-0");
    }

    #[test]
    fn test_most_idle_empty() {
        assert!(most_idle(vec![]).is_none());
    }
}
