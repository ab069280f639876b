//! Job queue using Redis Streams.
//!
//! Layout for a queue named `q`:
//! - stream `q` with consumer group `q:workers` holds the messages
//! - sorted set `q:leases` maps message id to lease deadline (ms since epoch)
//! - stream `q:dlq` receives dead letters
//! - `q:idem:<token>` holds idempotency reservations
//!
//! A message stays in the group's pending list from its first delivery until
//! it is acknowledged. `receive` reclaims pending entries whose lease ran out
//! (or that never got a lease record and sat idle past `orphan_idle`) before
//! reading new ones.
//!
//! A receipt names the message, the consumer and the delivery number. Every
//! operation on a receipt runs as a script that first checks the pending list
//! still shows that consumer and delivery, so a consumer whose message was
//! reclaimed gets `QueueError::LeaseLost` instead of touching it.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intake_models::JobDescriptor;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamPendingCountReply, StreamReadReply};
use redis::Script;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{QueueError, QueueResult};
use crate::queue::{JobQueue, QueueConfig};

/// Stream field carrying the encoded descriptor.
const PAYLOAD_FIELD: &str = "job";

/// Shared prelude: KEYS[1] stream, ARGV[1] group, ARGV[2] id, ARGV[3]
/// consumer, ARGV[4] delivery. Returns 0 unless the receipt still holds.
const HOLDER_CHECK: &str = r#"
local p = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)
if #p == 0 or p[1][2] ~= ARGV[3] or p[1][4] ~= tonumber(ARGV[4]) then
    return 0
end
"#;

/// KEYS[2] leases.
const ACKNOWLEDGE_BODY: &str = r#"
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
redis.call('XDEL', KEYS[1], ARGV[2])
redis.call('ZREM', KEYS[2], ARGV[2])
return 1
"#;

/// KEYS[2] leases, ARGV[5] new deadline.
const EXTEND_BODY: &str = r#"
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[3], 0, ARGV[2], 'JUSTID')
redis.call('ZADD', KEYS[2], ARGV[5], ARGV[2])
return 1
"#;

/// KEYS[2] leases.
const RELEASE_BODY: &str = r#"
redis.call('ZADD', KEYS[2], 0, ARGV[2])
return 1
"#;

/// KEYS[2] leases, KEYS[3] dead-letter stream, ARGV[5] payload, ARGV[6] error.
const DEAD_LETTER_BODY: &str = r#"
redis.call('XADD', KEYS[3], '*', 'job', ARGV[5], 'error', ARGV[6],
    'original_id', ARGV[2], 'delivery_count', ARGV[4])
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
redis.call('XDEL', KEYS[1], ARGV[2])
redis.call('ZREM', KEYS[2], ARGV[2])
return 1
"#;

/// Claim one pending entry if its lease ran out (or it is an orphan) and
/// record the new lease, in one step.
///
/// KEYS[1] stream, KEYS[2] leases. ARGV[1] group, ARGV[2] consumer, ARGV[3]
/// id, ARGV[4] now, ARGV[5] orphan idle ms, ARGV[6] new deadline.
/// Returns `{id, payload, delivery}` or nil.
const RECLAIM: &str = r#"
local p = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[3], ARGV[3], 1)
if #p == 0 then
    redis.call('ZREM', KEYS[2], ARGV[3])
    return false
end
local deadline = redis.call('ZSCORE', KEYS[2], ARGV[3])
if deadline then
    if tonumber(deadline) > tonumber(ARGV[4]) then return false end
elseif p[1][3] < tonumber(ARGV[5]) then
    return false
end
local claimed = redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[2], 0, ARGV[3])
if #claimed == 0 or not claimed[1] then
    redis.call('ZREM', KEYS[2], ARGV[3])
    return false
end
redis.call('ZADD', KEYS[2], ARGV[6], ARGV[3])
local fields = claimed[1][2]
local payload = ''
for i = 1, #fields, 2 do
    if fields[i] == 'job' then payload = fields[i + 1] end
end
return {claimed[1][1], payload, p[1][4] + 1}
"#;

/// One delivery of one message to one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Receipt {
    message_id: String,
    consumer: String,
    delivery: u32,
}

impl Receipt {
    fn encode(&self) -> String {
        format!("{}|{}|{}", self.message_id, self.consumer, self.delivery)
    }

    fn parse(receipt: &str) -> QueueResult<Self> {
        let invalid = || QueueError::lease_lost(receipt);
        let (rest, delivery) = receipt.rsplit_once('|').ok_or_else(invalid)?;
        let (message_id, consumer) = rest.split_once('|').ok_or_else(invalid)?;
        if message_id.is_empty() || consumer.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            message_id: message_id.to_string(),
            consumer: consumer.to_string(),
            delivery: delivery.parse().map_err(|_| invalid())?,
        })
    }
}

struct Scripts {
    acknowledge: Script,
    extend: Script,
    release: Script,
    dead_letter: Script,
    reclaim: Script,
}

impl Scripts {
    fn new() -> Self {
        let held = |body: &str| Script::new(&format!("{}{}", HOLDER_CHECK, body));
        Self {
            acknowledge: held(ACKNOWLEDGE_BODY),
            extend: held(EXTEND_BODY),
            release: held(RELEASE_BODY),
            dead_letter: held(DEAD_LETTER_BODY),
            reclaim: Script::new(RECLAIM),
        }
    }
}

/// Job queue client.
pub struct RedisQueue {
    client: redis::Client,
    config: QueueConfig,
    consumer_name: String,
    scripts: Scripts,
}

impl RedisQueue {
    /// Create a new job queue.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            consumer_name: format!("consumer-{}", Uuid::new_v4()),
            scripts: Scripts::new(),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env()?)
    }

    /// Name this process uses inside the consumer group.
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn connection(&self) -> QueueResult<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn envelope(
        &self,
        message_id: String,
        payload: String,
        delivery_count: u32,
        lease_expires_at: DateTime<Utc>,
    ) -> Envelope {
        let receipt = Receipt {
            message_id: message_id.clone(),
            consumer: self.consumer_name.clone(),
            delivery: delivery_count,
        };
        Envelope {
            receipt: receipt.encode(),
            message_id,
            payload,
            delivery_count,
            lease_expires_at,
        }
    }

    /// Run a receipt-checked script. `LeaseLost` when the receipt no longer
    /// holds the message.
    async fn invoke_held(
        &self,
        script: &Script,
        envelope: &Envelope,
        keys: &[&str],
        extra_args: &[&str],
    ) -> QueueResult<()> {
        let receipt = Receipt::parse(&envelope.receipt)?;
        let mut conn = self.connection().await?;

        let mut invocation = script.key(&self.config.queue_name);
        for key in keys {
            invocation.key(*key);
        }
        invocation
            .arg(&self.config.consumer_group)
            .arg(&receipt.message_id)
            .arg(&receipt.consumer)
            .arg(receipt.delivery);
        for arg in extra_args {
            invocation.arg(*arg);
        }

        let held: i32 = invocation.invoke_async(&mut conn).await?;
        if held == 0 {
            return Err(QueueError::lease_lost(&envelope.receipt));
        }
        Ok(())
    }

    /// Pending entries that may be reclaimable: lease deadlines in the past,
    /// then entries idle past `orphan_idle` (which covers those without a
    /// lease record).
    async fn reclaim_candidates(
        &self,
        conn: &mut MultiplexedConnection,
        now_ms: i64,
    ) -> QueueResult<Vec<String>> {
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.config.leases_key())
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(self.config.pending_scan)
            .query_async(conn)
            .await?;

        let idle: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.queue_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(self.config.orphan_idle.as_millis() as u64)
            .arg("-")
            .arg("+")
            .arg(self.config.pending_scan)
            .query_async(conn)
            .await?;

        let mut seen = HashSet::new();
        Ok(expired
            .into_iter()
            .chain(idle.ids.into_iter().map(|p| p.id))
            .filter(|id| seen.insert(id.clone()))
            .collect())
    }

    /// Claim pending entries whose lease has run out.
    async fn reclaim_expired(
        &self,
        conn: &mut MultiplexedConnection,
        max_messages: usize,
        lease_expires_at: DateTime<Utc>,
    ) -> QueueResult<Vec<Envelope>> {
        let now_ms = Utc::now().timestamp_millis();
        let candidates = self.reclaim_candidates(conn, now_ms).await?;

        let mut envelopes = Vec::new();
        for id in candidates {
            if envelopes.len() >= max_messages {
                break;
            }
            // Rechecked inside the script; a concurrent reclaim makes it return nil
            let claimed: Option<(String, String, u32)> = self
                .scripts
                .reclaim
                .key(&self.config.queue_name)
                .key(self.config.leases_key())
                .arg(&self.config.consumer_group)
                .arg(&self.consumer_name)
                .arg(&id)
                .arg(now_ms)
                .arg(self.config.orphan_idle.as_millis() as u64)
                .arg(lease_expires_at.timestamp_millis())
                .invoke_async(conn)
                .await?;

            if let Some((message_id, payload, delivery_count)) = claimed {
                info!(
                    "Reclaimed message {} (delivery {})",
                    message_id, delivery_count
                );
                envelopes.push(self.envelope(message_id, payload, delivery_count, lease_expires_at));
            }
        }
        Ok(envelopes)
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        count: usize,
        lease_expires_at: DateTime<Utc>,
    ) -> QueueResult<Vec<Envelope>> {
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(self.config.poll_wait.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.config.queue_name)
            .arg(">") // Only new messages
            .query_async(conn)
            .await?;

        let mut envelopes = Vec::new();
        for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream_key.ids {
                debug!("Received message {}", entry.id);
                let payload = stream_payload(&entry);
                envelopes.push(self.envelope(entry.id, payload, 1, lease_expires_at));
            }
        }
        Ok(envelopes)
    }
}

/// A missing payload field still yields an envelope; the consumer
/// dead-letters what it cannot decode.
fn stream_payload(entry: &StreamId) -> String {
    entry.get(PAYLOAD_FIELD).unwrap_or_default()
}

fn deadline_after(duration: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[async_trait]
impl JobQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.config.queue_name
    }

    /// Create the stream and consumer group if they do not exist.
    async fn ensure_exists(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.queue_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    async fn publish(&self, payload: &str) -> QueueResult<String> {
        let mut conn = self.connection().await?;

        let message_id: String = redis::cmd("XADD")
            .arg(&self.config.queue_name)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        debug!("Published message {} to {}", message_id, self.config.queue_name);
        Ok(message_id)
    }

    async fn receive(&self, max_messages: usize, lease: Duration) -> QueueResult<Vec<Envelope>> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let lease_expires_at = deadline_after(lease);

        let mut envelopes = self
            .reclaim_expired(&mut conn, max_messages, lease_expires_at)
            .await?;
        if envelopes.len() < max_messages {
            let fresh = self
                .read_new(&mut conn, max_messages - envelopes.len(), lease_expires_at)
                .await?;

            // Reclaimed entries got their lease inside the claim script
            if !fresh.is_empty() {
                let deadline = lease_expires_at.timestamp_millis();
                let mut pipe = redis::pipe();
                for envelope in &fresh {
                    pipe.cmd("ZADD")
                        .arg(self.config.leases_key())
                        .arg(deadline)
                        .arg(&envelope.message_id)
                        .ignore();
                }
                pipe.query_async::<()>(&mut conn).await?;
            }
            envelopes.extend(fresh);
        }

        Ok(envelopes)
    }

    async fn acknowledge(&self, envelope: &Envelope) -> QueueResult<()> {
        let leases = self.config.leases_key();
        self.invoke_held(&self.scripts.acknowledge, envelope, &[&leases], &[])
            .await?;

        debug!("Acknowledged message: {}", envelope.message_id);
        Ok(())
    }

    async fn extend_lease(&self, envelope: &Envelope, duration: Duration) -> QueueResult<()> {
        let leases = self.config.leases_key();
        let deadline = deadline_after(duration).timestamp_millis().to_string();
        // JUSTID resets the idle clock without counting a delivery.
        self.invoke_held(&self.scripts.extend, envelope, &[&leases], &[&deadline])
            .await
    }

    async fn release(&self, envelope: &Envelope) -> QueueResult<()> {
        let leases = self.config.leases_key();
        // A deadline in the past lets the next receive reclaim it.
        self.invoke_held(&self.scripts.release, envelope, &[&leases], &[])
            .await?;

        debug!("Released message: {}", envelope.message_id);
        Ok(())
    }

    async fn dead_letter(&self, envelope: &Envelope, error: &str) -> QueueResult<()> {
        let leases = self.config.leases_key();
        // DLQ write and removal land together or not at all
        self.invoke_held(
            &self.scripts.dead_letter,
            envelope,
            &[&leases, &self.config.dlq_name],
            &[&envelope.payload, error],
        )
        .await?;

        warn!("Moved message {} to DLQ: {}", envelope.message_id, error);
        Ok(())
    }

    async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = redis::cmd("XLEN")
            .arg(&self.config.queue_name)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn dead_letter_len(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = redis::cmd("XLEN")
            .arg(&self.config.dlq_name)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn reserve_idempotency_key(
        &self,
        key: &str,
        job: &JobDescriptor,
        ttl: Duration,
    ) -> QueueResult<Option<JobDescriptor>> {
        let mut conn = self.connection().await?;
        let redis_key = self.config.idempotency_key(key);
        let value = serde_json::to_string(job)?;

        let set: Option<String> = redis::cmd("SET")
            .arg(&redis_key)
            .arg(&value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        if set.is_some() {
            return Ok(None);
        }

        let existing: Option<String> = redis::cmd("GET")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await?;
        match existing {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            // Expired between SET and GET; treat as a fresh reservation
            None => {
                warn!("Idempotency key {} expired during reservation", key);
                Ok(None)
            }
        }
    }

    async fn forget_idempotency_key(&self, key: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(self.config.idempotency_key(key))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_encodes_delivery() {
        let receipt = Receipt {
            message_id: "1700000000000-0".to_string(),
            consumer: "consumer-a".to_string(),
            delivery: 3,
        };
        let encoded = receipt.encode();
        assert_eq!(encoded, "1700000000000-0|consumer-a|3");
        assert_eq!(Receipt::parse(&encoded).unwrap(), receipt);
    }

    #[test]
    fn test_consumer_name_may_contain_separator() {
        let receipt = Receipt::parse("1-0|pod|7|2").unwrap();
        assert_eq!(receipt.message_id, "1-0");
        assert_eq!(receipt.consumer, "pod|7");
        assert_eq!(receipt.delivery, 2);
    }

    #[test]
    fn test_bare_message_id_is_not_a_receipt() {
        for receipt in ["1700000000000-0", "1-0|consumer", "|consumer|1", "1-0|consumer|x"] {
            assert!(matches!(
                Receipt::parse(receipt),
                Err(QueueError::LeaseLost(_))
            ));
        }
    }
}
