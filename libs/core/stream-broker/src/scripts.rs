//! Server-side scripts
//!
//! Each primitive is one `EVALSHA` round trip, so concurrent producers and
//! scanners in different processes see it as atomic.

use crate::error::BrokerError;
use crate::message::JOB_FIELD;
use once_cell::sync::Lazy;
use redis::Script;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// KEYS[1] lock key, ARGV[1] ttl seconds, ARGV[2] owner token
static ACQUIRE_ADVISORY_LOCK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('SET', KEYS[1], ARGV[2], 'NX', 'EX', ARGV[1]) then
    return 1
end
return 0
"#,
    )
});

/// KEYS[1] lock key, ARGV[1] owner token
static RELEASE_ADVISORY_LOCK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#,
    )
});

/// KEYS[1] status key, KEYS[2] stream key
/// ARGV[1] job field, ARGV[2] encoded message, ARGV[3] retention seconds
///
/// Returns 1 for a duplicate, 0 when the message was streamed.
static CHECK_IDEMPOTENT_INSERT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    redis.call('HINCRBY', KEYS[1], 'duplicates', 1)
    return 1
end
local stream_id = redis.call('XADD', KEYS[2], '*', ARGV[1], ARGV[2])
redis.call('HSET', KEYS[1], 'status', 'published', 'stream_id', stream_id, 'job', ARGV[2], 'duplicates', 0)
redis.call('EXPIRE', KEYS[1], ARGV[3])
return 0
"#,
    )
});

/// KEYS[1] status key, KEYS[2] stream key
/// ARGV[1] job field, ARGV[2] encoded message, ARGV[3] retention seconds
///
/// Streams the message again and resets its status hash to published,
/// keeping the duplicate counter. Returns the new stream id.
static READMIT_SEQUENTIAL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local stream_id = redis.call('XADD', KEYS[2], '*', ARGV[1], ARGV[2])
redis.call('HDEL', KEYS[1], 'retry', 'info', 'end_time')
redis.call('HSET', KEYS[1], 'status', 'published', 'stream_id', stream_id, 'job', ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
return stream_id
"#,
    )
});

/// KEYS[1] stream key, KEYS[2] lock key
/// ARGV[1] ttl seconds, ARGV[2] job field, ARGV[3] encoded message,
/// ARGV[4] message id, ARGV[5] locked-at millis
///
/// Returns the new stream id, or false when the order key is held.
static SEQUENCE_LOCKED_INSERT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
    return false
end
local stream_id = redis.call('XADD', KEYS[1], '*', ARGV[2], ARGV[3])
redis.call('HSET', KEYS[2], 'id', ARGV[4], 'stream_id', stream_id, 'locked_at', ARGV[5])
redis.call('EXPIRE', KEYS[2], ARGV[1])
return stream_id
"#,
    )
});

/// KEYS[1] lock key, ARGV[1] message id
static RELEASE_SEQUENCE_LOCK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('HGET', KEYS[1], 'id') == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#,
    )
});

/// KEYS[1] zset key, KEYS[2] stream key
/// ARGV[1] job field, ARGV[2..] zset members
///
/// A member is streamed only if this call removed it, so two promoters racing
/// on the same member add it once.
static PROMOTE_DUE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local promoted = 0
for i = 2, #ARGV do
    if redis.call('ZREM', KEYS[1], ARGV[i]) == 1 then
        redis.call('XADD', KEYS[2], '*', ARGV[1], ARGV[i])
        promoted = promoted + 1
    end
end
return promoted
"#,
    )
});

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Set `key` with a TTL only if absent. Returns whether this caller holds it.
pub async fn acquire_advisory_lock(
    conn: &mut ConnectionManager,
    key: &str,
    token: &str,
    ttl: Duration,
) -> Result<bool, BrokerError> {
    let acquired: i64 = ACQUIRE_ADVISORY_LOCK
        .key(key)
        .arg(ttl_secs(ttl))
        .arg(token)
        .invoke_async(conn)
        .await?;
    Ok(acquired == 1)
}

/// Delete `key` if `token` still owns it
pub async fn release_advisory_lock(
    conn: &mut ConnectionManager,
    key: &str,
    token: &str,
) -> Result<bool, BrokerError> {
    let released: i64 = RELEASE_ADVISORY_LOCK
        .key(key)
        .arg(token)
        .invoke_async(conn)
        .await?;
    Ok(released == 1)
}

/// Stream `job` unless `status_key` already marks the id as seen.
/// Returns `true` for a duplicate.
pub async fn check_idempotent_insert(
    conn: &mut ConnectionManager,
    status_key: &str,
    stream_key: &str,
    job: &str,
    retention: Duration,
) -> Result<bool, BrokerError> {
    let duplicate: i64 = CHECK_IDEMPOTENT_INSERT
        .key(status_key)
        .key(stream_key)
        .arg(JOB_FIELD)
        .arg(job)
        .arg(ttl_secs(retention))
        .invoke_async(conn)
        .await?;
    Ok(duplicate == 1)
}

/// Stream an already admitted sequential message again. Returns the stream id.
pub async fn readmit_sequential(
    conn: &mut ConnectionManager,
    status_key: &str,
    stream_key: &str,
    job: &str,
    retention: Duration,
) -> Result<String, BrokerError> {
    let stream_id: String = READMIT_SEQUENTIAL
        .key(status_key)
        .key(stream_key)
        .arg(JOB_FIELD)
        .arg(job)
        .arg(ttl_secs(retention))
        .invoke_async(conn)
        .await?;
    Ok(stream_id)
}

/// Stream `job` and take the order-key lock, unless the lock is held.
/// Returns the stream id when admitted.
pub async fn sequence_locked_insert(
    conn: &mut ConnectionManager,
    stream_key: &str,
    lock_key: &str,
    ttl: Duration,
    job: &str,
    message_id: &str,
) -> Result<Option<String>, BrokerError> {
    let stream_id: Option<String> = SEQUENCE_LOCKED_INSERT
        .key(stream_key)
        .key(lock_key)
        .arg(ttl_secs(ttl))
        .arg(JOB_FIELD)
        .arg(job)
        .arg(message_id)
        .arg(chrono::Utc::now().timestamp_millis())
        .invoke_async(conn)
        .await?;
    Ok(stream_id)
}

/// Delete the order-key lock if `message_id` holds it
pub async fn release_sequence_lock(
    conn: &mut ConnectionManager,
    lock_key: &str,
    message_id: &str,
) -> Result<bool, BrokerError> {
    let released: i64 = RELEASE_SEQUENCE_LOCK
        .key(lock_key)
        .arg(message_id)
        .invoke_async(conn)
        .await?;
    Ok(released == 1)
}

/// Move `members` from the zset to the stream. Returns how many moved.
pub async fn promote_due(
    conn: &mut ConnectionManager,
    zset_key: &str,
    stream_key: &str,
    members: &[String],
) -> Result<usize, BrokerError> {
    if members.is_empty() {
        return Ok(0);
    }

    let mut invocation = PROMOTE_DUE.key(zset_key);
    invocation.key(stream_key).arg(JOB_FIELD);
    for member in members {
        invocation.arg(member);
    }

    let promoted: i64 = invocation.invoke_async(conn).await?;
    Ok(promoted.max(0) as usize)
}
