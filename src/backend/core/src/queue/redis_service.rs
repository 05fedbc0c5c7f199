//! Redis-backed queue service.
//!
//! Each queue lives under `docflow:queue:{region}:{name}`:
//!
//! | key | type | content |
//! |---|---|---|
//! | `:ready` | list | message ids waiting for delivery |
//! | `:inflight` | sorted set | delivered ids scored by visibility deadline (ms) |
//! | `:msg:{id}` | hash | `body`, `receive_count`, current `receipt` |
//! | `:attrs` | hash | `dead_letter_key`, `max_receive_count` |
//!
//! Receive and delete run as Lua scripts so visibility, redrive and receipt
//! checks are atomic. Long polling is done client side.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{QueueEndpoint, QueueMessage, QueueService, ReceiveRequest, RedrivePolicy};
use crate::error::{DocflowError, Result};

const RECEIVE_SCRIPT: &str = r#"
local base = KEYS[1]
local now = tonumber(ARGV[1])
local visibility = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
local ready = base .. ':ready'
local inflight = base .. ':inflight'

local expired = redis.call('ZRANGEBYSCORE', inflight, '-inf', now)
for i = #expired, 1, -1 do
    redis.call('ZREM', inflight, expired[i])
    redis.call('LPUSH', ready, expired[i])
end

local dead_letter = redis.call('HGET', base .. ':attrs', 'dead_letter_key')
local max_receives = tonumber(redis.call('HGET', base .. ':attrs', 'max_receive_count') or '0')

local out = {}
local delivered = 0
while delivered < max do
    local id = redis.call('LPOP', ready)
    if not id then
        break
    end
    local msg = base .. ':msg:' .. id
    if redis.call('EXISTS', msg) == 1 then
        local count = redis.call('HINCRBY', msg, 'receive_count', 1)
        if dead_letter and max_receives > 0 and count > max_receives then
            local target = dead_letter .. ':msg:' .. id
            redis.call('RENAME', msg, target)
            redis.call('HSET', target, 'receive_count', 0)
            redis.call('HDEL', target, 'receipt')
            redis.call('RPUSH', dead_letter .. ':ready', id)
        else
            local receipt = id .. ':' .. count
            redis.call('HSET', msg, 'receipt', receipt)
            redis.call('ZADD', inflight, now + visibility, id)
            table.insert(out, id)
            table.insert(out, receipt)
            table.insert(out, redis.call('HGET', msg, 'body'))
            delivered = delivered + 1
        end
    end
end
return out
"#;

const DELETE_SCRIPT: &str = r#"
local msg = KEYS[1] .. ':msg:' .. ARGV[1]
if redis.call('HGET', msg, 'receipt') ~= ARGV[2] then
    return 0
end
redis.call('ZREM', KEYS[1] .. ':inflight', ARGV[1])
redis.call('DEL', msg)
return 1
"#;

/// Interval between two receive attempts while long polling.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Queue service over a Redis connection manager.
#[derive(Clone)]
pub struct RedisQueueService {
    connection: ConnectionManager,
    receive_script: redis::Script,
    delete_script: redis::Script,
}

impl std::fmt::Debug for RedisQueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueService")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisQueueService {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            receive_script: redis::Script::new(RECEIVE_SCRIPT),
            delete_script: redis::Script::new(DELETE_SCRIPT),
        }
    }

    /// Connect to `url` and build the service.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        debug!("Redis queue service connected");
        Ok(Self::new(connection))
    }

    fn base_key(endpoint: &QueueEndpoint) -> String {
        queue_key(&endpoint.name, &endpoint.region)
    }

    async fn receive_now(
        &self,
        base: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<QueueMessage>> {
        let mut conn = self.connection.clone();
        let flat: Vec<String> = self
            .receive_script
            .key(base)
            .arg(Utc::now().timestamp_millis())
            .arg(request.visibility_timeout.as_millis() as u64)
            .arg(request.max_messages)
            .invoke_async(&mut conn)
            .await?;

        Ok(flat
            .chunks_exact(3)
            .map(|triple| QueueMessage {
                message_id: triple[0].clone(),
                receipt_handle: triple[1].clone(),
                body: triple[2].clone(),
            })
            .collect())
    }
}

fn queue_key(name: &str, region: &str) -> String {
    format!("docflow:queue:{}:{}", region, name)
}

#[async_trait]
impl QueueService for RedisQueueService {
    async fn create_queue(
        &self,
        name: &str,
        region: &str,
        redrive: Option<RedrivePolicy>,
    ) -> Result<QueueEndpoint> {
        let endpoint = QueueEndpoint::new(name, region);
        let attrs = format!("{}:attrs", Self::base_key(&endpoint));
        let mut conn = self.connection.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&attrs, "created_at", Utc::now().to_rfc3339())
            .ignore();
        if let Some(policy) = &redrive {
            pipe.hset(&attrs, "dead_letter_key", Self::base_key(&policy.dead_letter))
                .ignore()
                .hset(&attrs, "max_receive_count", policy.max_receive_count)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(queue = %endpoint.name, region = %endpoint.region, redrive = redrive.is_some(), "Queue created");
        Ok(endpoint)
    }

    async fn send(&self, endpoint: &QueueEndpoint, body: &str) -> Result<String> {
        let base = Self::base_key(endpoint);
        let id = Uuid::new_v4().to_string();
        let mut conn = self.connection.clone();

        redis::pipe()
            .atomic()
            .hset_multiple(
                format!("{}:msg:{}", base, id),
                &[("body", body), ("receive_count", "0")],
            )
            .ignore()
            .rpush(format!("{}:ready", base), &id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(id)
    }

    async fn receive(
        &self,
        endpoint: &QueueEndpoint,
        request: &ReceiveRequest,
    ) -> Result<Vec<QueueMessage>> {
        let base = Self::base_key(endpoint);
        let deadline = Instant::now() + request.wait_time;

        loop {
            let messages = self.receive_now(&base, request).await?;
            let now = Instant::now();
            if !messages.is_empty() || now >= deadline {
                return Ok(messages);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn delete_message(&self, endpoint: &QueueEndpoint, receipt_handle: &str) -> Result<()> {
        let (message_id, _) = receipt_handle.split_once(':').ok_or_else(|| {
            DocflowError::queue(format!("Malformed receipt handle: {}", receipt_handle))
        })?;
        let mut conn = self.connection.clone();

        let deleted: i64 = self
            .delete_script
            .key(Self::base_key(endpoint))
            .arg(message_id)
            .arg(receipt_handle)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            return Err(DocflowError::queue(format!(
                "Receipt handle is no longer valid: {}",
                receipt_handle
            )));
        }
        Ok(())
    }
}
