//! Scheduled-mode promotion loop
//!
//! Scheduled messages wait in a zset scored by `due_ms + priority / 1000`.
//! Each tick one runner per route moves up to `schedule_batch` due members onto
//! the route's delay stream, earliest first, higher priority first within the
//! same millisecond.

use crate::alert::{Alert, AlertKind};
use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::message::{Message, Mode};
use crate::metrics::BrokerMetrics;
use crate::result::ProcessResult;
use crate::scripts;
use chrono::Utc;
use std::cmp::Reverse;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// Another runner holds the tick lock
    LockBusy,
    /// Members moved to the stream and undecodable members discarded
    Promoted { promoted: usize, dropped: usize },
}

pub struct Scheduler {
    ctx: BrokerContext,
    zset_key: String,
    stream_key: String,
    lock_key: String,
    token: String,
    metrics: BrokerMetrics,
}

impl Scheduler {
    pub fn new(ctx: BrokerContext, channel: &str, topic: &str) -> Self {
        let keys = ctx.keys();
        let stream_key = keys.stream(Mode::Scheduled, channel, topic);

        Self {
            zset_key: keys.zset(channel, topic),
            lock_key: keys.schedule_lock(channel, topic),
            token: Uuid::new_v4().to_string(),
            metrics: BrokerMetrics::new(stream_key.clone(), Mode::Scheduled.as_str()),
            stream_key,
            ctx,
        }
    }

    pub fn zset_key(&self) -> &str {
        &self.zset_key
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        info!(zset = %self.zset_key, stream = %self.stream_key, "Starting scheduler");
        let tick = self.ctx.config().schedule_tick;

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
                _ = tokio::time::sleep(tick) => {}
            }

            match self.tick().await {
                Ok(PromoteOutcome::Promoted { promoted, dropped }) if promoted + dropped > 0 => {
                    debug!(zset = %self.zset_key, promoted, dropped, "Promotion tick");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(zset = %self.zset_key, error = %e, "Promotion tick failed");
                    self.ctx.alert(Alert::new(
                        AlertKind::SchedulerFailure,
                        &self.stream_key,
                        e.to_string(),
                    ));
                }
            }
        }

        info!(zset = %self.zset_key, "Scheduler stopped");
        Ok(())
    }

    /// One guarded promotion pass
    pub async fn tick(&self) -> Result<PromoteOutcome, BrokerError> {
        let mut conn = self.ctx.conn();
        let ttl = self.ctx.config().advisory_lock_ttl;

        if !scripts::acquire_advisory_lock(&mut conn, &self.lock_key, &self.token, ttl).await? {
            return Ok(PromoteOutcome::LockBusy);
        }

        let outcome = self.promote().await;

        if let Err(e) =
            scripts::release_advisory_lock(&mut conn, &self.lock_key, &self.token).await
        {
            warn!(lock = %self.lock_key, error = %e, "Failed to release scheduler lock");
        }

        outcome
    }

    async fn promote(&self) -> Result<PromoteOutcome, BrokerError> {
        let mut conn = self.ctx.conn();
        let now_ms = Utc::now().timestamp_millis();

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.zset_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(self.ctx.config().schedule_batch)
            .query_async(&mut conn)
            .await?;

        if members.is_empty() {
            return Ok(PromoteOutcome::Promoted {
                promoted: 0,
                dropped: 0,
            });
        }

        let (due, undecodable) = split_members(members);
        let dropped = self.discard(&undecodable).await?;

        let ordered: Vec<String> = due.into_iter().map(|(_, member)| member).collect();
        let promoted = scripts::promote_due(&mut conn, &self.zset_key, &self.stream_key, &ordered)
            .await?;
        self.metrics.messages_promoted(promoted);

        Ok(PromoteOutcome::Promoted { promoted, dropped })
    }

    /// Log undecodable members, then remove them. A failed log write keeps
    /// the member for the next tick.
    async fn discard(&self, members: &[(String, String)]) -> Result<usize, BrokerError> {
        let log = self.ctx.process_log();
        let mut removed = Vec::with_capacity(members.len());

        for (member, details) in members {
            let record = ProcessResult::decode_error(&self.zset_key, member, member, details);
            match log.add_log(&record).await {
                Ok(()) => removed.push(member.as_str()),
                Err(e) => {
                    warn!(zset = %self.zset_key, error = %e, "Failed to log undecodable member")
                }
            }
            self.metrics.decode_failed();
        }

        if removed.is_empty() {
            return Ok(0);
        }

        let mut conn = self.ctx.conn();
        let count: i64 = redis::cmd("ZREM")
            .arg(&self.zset_key)
            .arg(&removed)
            .query_async(&mut conn)
            .await?;
        Ok(count.max(0) as usize)
    }
}

/// Decode members into promotion order; undecodable ones come back with the
/// decode error text
fn split_members(members: Vec<String>) -> (Vec<(Message, String)>, Vec<(String, String)>) {
    let mut due = Vec::with_capacity(members.len());
    let mut undecodable = Vec::new();

    for member in members {
        match Message::decode("zset member", &member) {
            Ok(message) => due.push((message, member)),
            Err(e) => undecodable.push((member, e.to_string())),
        }
    }

    due.sort_by_key(|(m, _)| (m.due_at().timestamp_millis(), Reverse(m.priority)));
    (due, undecodable)
}
