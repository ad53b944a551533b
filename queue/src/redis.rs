use crate::{AckAction, AckMessage, Delivery, JobEnvelope, JobQueue};
use async_trait::async_trait;
use deadpool_redis::redis;
use deadpool_redis::redis::{AsyncCommands, FromRedisValue};
use errors::error::QueueError;
use errors::Result;
use log::{debug, error, info, warn};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// How long a delivery may sit idle before the claimer steals it.
    pub lease: Duration,
    pub claim_interval: Duration,
    pub promote_interval: Duration,
    pub batch_size: usize,
    /// Stream retention; entries older than this are trimmed.
    pub retention_hours: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(60),
            claim_interval: Duration::from_secs(30),
            promote_interval: Duration::from_millis(500),
            batch_size: 32,
            retention_hours: 24,
        }
    }
}

struct TopicRouter {
    routes: HashMap<String, mpsc::Sender<Delivery>>,
}

/// Redis Streams job queue. Immediate jobs go straight onto the topic
/// stream; delayed jobs park in a ZSET keyed by ready-time and a promoter
/// loop moves them over when due. Consumer groups give at-least-once
/// delivery; XAUTOCLAIM recovers deliveries whose worker died mid-handler.
pub struct RedisJobQueue {
    pool: Arc<deadpool_redis::Pool>,
    namespace: String,
    group_id: String,
    consumer_name: String,
    settings: QueueSettings,
    router: Arc<RwLock<TopicRouter>>,
    ack_tx: mpsc::Sender<AckMessage>,
}

impl RedisJobQueue {
    pub fn new(
        pool: Arc<deadpool_redis::Pool>,
        namespace: &str,
        settings: QueueSettings,
    ) -> Arc<Self> {
        let consumer_name = uuid::Uuid::new_v4().to_string();
        let group_id = format!("{}:workers", namespace);
        let (ack_tx, ack_rx) = mpsc::channel::<AckMessage>(10_000);
        let router = Arc::new(RwLock::new(TopicRouter {
            routes: HashMap::new(),
        }));

        let queue = Arc::new(Self {
            pool,
            namespace: namespace.to_string(),
            group_id,
            consumer_name,
            settings,
            router,
            ack_tx,
        });

        queue.clone().spawn_ack_processor(ack_rx);
        queue.clone().spawn_listener();
        queue.clone().spawn_promoter();
        queue.clone().spawn_claimer();
        queue.clone().spawn_depth_monitor();

        queue
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.namespace, topic)
    }

    fn delayed_key(&self, topic: &str) -> String {
        format!("{}:{}:delayed", self.namespace, topic)
    }

    fn dedup_key(&self, topic: &str, job_id: &str) -> String {
        format!("{}:{}:dedup:{}", self.namespace, topic, job_id)
    }

    fn dlq_key(&self, topic: &str) -> String {
        format!("{}:{}:dlq", self.namespace, topic)
    }

    fn topic_of_stream_key(&self, stream_key: &str) -> String {
        stream_key
            .strip_prefix(&format!("{}:", self.namespace))
            .unwrap_or(stream_key)
            .to_string()
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|_| QueueError::ConnectionFailed.into())
    }

    fn parse_envelope(raw: &[u8]) -> Option<JobEnvelope> {
        match serde_json::from_slice::<JobEnvelope>(raw) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                error!("Dropping undecodable job envelope: {}", e);
                None
            }
        }
    }

    fn spawn_listener(self: Arc<Self>) {
        tokio::spawn(async move {
            info!(
                "Queue listener started (group: {}, consumer: {})",
                self.group_id, self.consumer_name
            );
            let mut conn: Option<deadpool_redis::Connection> = None;

            loop {
                let routes = {
                    let r = self.router.read().await;
                    r.routes.clone()
                };

                if routes.is_empty() {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }

                let keys: Vec<String> = routes.keys().cloned().collect();
                let ids: Vec<&str> = vec![">"; keys.len()];

                if conn.is_none() {
                    match self.pool.get().await {
                        Ok(c) => conn = Some(c),
                        Err(e) => {
                            error!("Queue listener failed to get connection: {}. Retrying...", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    }
                }
                let active_conn = match conn.as_mut() {
                    Some(c) => c,
                    None => continue,
                };

                let opts = redis::streams::StreamReadOptions::default()
                    .group(&self.group_id, &self.consumer_name)
                    .block(2000)
                    .count(self.settings.batch_size);

                let result: redis::RedisResult<redis::streams::StreamReadReply> =
                    active_conn.xread_options(&keys, &ids, &opts).await;

                match result {
                    Ok(reply) => {
                        for stream_key in reply.keys {
                            let s_key = stream_key.key;
                            let Some(sender) = routes.get(&s_key) else {
                                continue;
                            };
                            for stream_id in stream_key.ids {
                                let Some(val) = stream_id.map.get("payload") else {
                                    continue;
                                };
                                let Ok(raw) = Vec::<u8>::from_redis_value(val) else {
                                    continue;
                                };
                                let Some(envelope) = Self::parse_envelope(&raw) else {
                                    // Unparseable entries would redeliver forever.
                                    let _: std::result::Result<i64, _> = active_conn
                                        .xack(&s_key, &self.group_id, &[&stream_id.id])
                                        .await;
                                    continue;
                                };

                                counter!("queue_consume_total", "topic" => self.topic_of_stream_key(&s_key))
                                    .increment(1);

                                let delivery = Delivery {
                                    envelope,
                                    delivery_id: format!("{}@{}", s_key, stream_id.id),
                                    ack_tx: self.ack_tx.clone(),
                                };
                                if sender.send(delivery).await.is_err() {
                                    warn!("Subscriber for {} dropped", s_key);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Queue listener read failed: {}. Reconnecting...", e);
                        conn = None;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    /// Moves due delayed jobs onto their stream. Atomic per batch so a
    /// promoter racing a twin on another node never double-promotes.
    fn spawn_promoter(self: Arc<Self>) {
        tokio::spawn(async move {
            let script = redis::Script::new(
                r"
                local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
                for i, member in ipairs(due) do
                    redis.call('XADD', KEYS[2], '*', 'payload', member)
                    redis.call('ZREM', KEYS[1], member)
                end
                return #due
            ",
            );
            let mut interval = tokio::time::interval(self.settings.promote_interval);

            loop {
                interval.tick().await;

                let keys: Vec<String> = {
                    let r = self.router.read().await;
                    r.routes.keys().cloned().collect()
                };
                if keys.is_empty() {
                    continue;
                }

                let mut conn = match self.pool.get().await {
                    Ok(c) => c,
                    Err(e) => {
                        error!("Promoter connection failed: {}", e);
                        continue;
                    }
                };

                let now = Self::now_ms();
                for stream_key in keys {
                    let delayed_key = format!("{}:delayed", stream_key);
                    let promoted: redis::RedisResult<i64> = script
                        .key(&delayed_key)
                        .key(&stream_key)
                        .arg(now)
                        .invoke_async(&mut conn)
                        .await;

                    match promoted {
                        Ok(n) if n > 0 => {
                            debug!("Promoted {} delayed jobs onto {}", n, stream_key);
                            counter!("queue_promote_total", "topic" => self.topic_of_stream_key(&stream_key))
                                .increment(n as u64);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Promotion failed for {}: {}", stream_key, e),
                    }
                }
            }
        });
    }

    /// Recovers deliveries whose lease expired (worker crash, lost node).
    fn spawn_claimer(self: Arc<Self>) {
        tokio::spawn(async move {
            let claimer_name = format!("{}-claimer", self.consumer_name);
            let mut interval = tokio::time::interval(self.settings.claim_interval);

            loop {
                interval.tick().await;

                let routes: Vec<(String, mpsc::Sender<Delivery>)> = {
                    let r = self.router.read().await;
                    r.routes.iter().map(|(k, s)| (k.clone(), s.clone())).collect()
                };
                if routes.is_empty() {
                    continue;
                }

                let mut conn = match self.pool.get().await {
                    Ok(c) => c,
                    Err(e) => {
                        error!("Claimer connection failed: {}", e);
                        continue;
                    }
                };

                for (stream_key, sender) in routes {
                    loop {
                        let result: redis::RedisResult<(
                            String,
                            Vec<(String, Vec<Vec<u8>>)>,
                            Vec<String>,
                        )> = redis::cmd("XAUTOCLAIM")
                            .arg(&stream_key)
                            .arg(&self.group_id)
                            .arg(&claimer_name)
                            .arg(self.settings.lease.as_millis() as u64)
                            .arg("0-0")
                            .arg("COUNT")
                            .arg(100)
                            .query_async(&mut conn)
                            .await;

                        match result {
                            Ok((cursor, messages, _deleted)) => {
                                let is_empty = messages.is_empty();
                                if !is_empty {
                                    info!(
                                        "Reclaimed {} stalled jobs from {}",
                                        messages.len(),
                                        stream_key
                                    );
                                    counter!("queue_claim_total", "topic" => self.topic_of_stream_key(&stream_key))
                                        .increment(messages.len() as u64);

                                    for (id, fields) in messages {
                                        let Some(envelope) = Self::payload_from_fields(fields)
                                        else {
                                            continue;
                                        };
                                        let delivery = Delivery {
                                            envelope,
                                            delivery_id: format!("{}@{}", stream_key, id),
                                            ack_tx: self.ack_tx.clone(),
                                        };
                                        if sender.send(delivery).await.is_err() {
                                            warn!("Failed to route reclaimed job from {}", stream_key);
                                        }
                                    }
                                }

                                if cursor == "0-0" || is_empty {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("XAUTOCLAIM failed for {}: {}", stream_key, e);
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    fn payload_from_fields(fields: Vec<Vec<u8>>) -> Option<JobEnvelope> {
        let mut iter = fields.into_iter();
        while let Some(key) = iter.next() {
            let val = iter.next()?;
            if key == b"payload" {
                return Self::parse_envelope(&val);
            }
        }
        None
    }

    fn spawn_depth_monitor(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));
            loop {
                interval.tick().await;

                let keys: Vec<String> = {
                    let r = self.router.read().await;
                    r.routes.keys().cloned().collect()
                };
                if keys.is_empty() {
                    continue;
                }

                let Ok(mut conn) = self.pool.get().await else {
                    continue;
                };
                for stream_key in keys {
                    let len: u64 = redis::cmd("XLEN")
                        .arg(&stream_key)
                        .query_async(&mut conn)
                        .await
                        .unwrap_or(0);
                    let topic = self.topic_of_stream_key(&stream_key);
                    gauge!("queue_len", "topic" => topic.clone()).set(len as f64);
                    if len > 1000 {
                        warn!("High queue depth for {}: {}", topic, len);
                    }
                }
            }
        });
    }

    fn spawn_ack_processor(self: Arc<Self>, mut ack_rx: mpsc::Receiver<AckMessage>) {
        tokio::spawn(async move {
            // XADD to the DLQ and XACK in one step so a crash between the
            // two cannot lose the job.
            let dead_script = redis::Script::new(
                r"
                redis.call('XADD', KEYS[3], '*', 'payload', ARGV[1], 'reason', ARGV[2], 'original_id', ARGV[3])
                redis.call('XACK', KEYS[1], KEYS[2], ARGV[3])
                redis.call('XDEL', KEYS[1], ARGV[3])
                return 1
            ",
            );

            while let Some(msg) = ack_rx.recv().await {
                let (stream_key, entry_id) = match msg.delivery_id.split_once('@') {
                    Some((k, i)) => (k.to_string(), i.to_string()),
                    None => {
                        error!("Invalid delivery id in ack: {}", msg.delivery_id);
                        continue;
                    }
                };
                let topic = self.topic_of_stream_key(&stream_key);

                let mut conn = match self.pool.get().await {
                    Ok(c) => c,
                    Err(e) => {
                        // The lease will expire and the claimer redelivers.
                        error!("Ack processor connection failed: {}", e);
                        continue;
                    }
                };

                match msg.action {
                    AckAction::Ack => {
                        let mut pipe = redis::pipe();
                        pipe.xack(&stream_key, &self.group_id, &[&entry_id]).ignore();
                        pipe.cmd("XDEL").arg(&stream_key).arg(&entry_id).ignore();
                        if msg.envelope.dedup {
                            pipe.del(self.dedup_key(&topic, &msg.envelope.id)).ignore();
                        }
                        if let Err(e) = pipe.query_async::<()>(&mut conn).await {
                            error!("Failed to ack {}: {}", msg.delivery_id, e);
                        } else {
                            counter!("queue_ack_total", "topic" => topic).increment(1);
                        }
                    }
                    AckAction::Retry { delay, reason } => {
                        let mut envelope = msg.envelope;
                        envelope.attempts += 1;
                        debug!(
                            "Retrying job {} on {} (attempt {}/{}): {}",
                            envelope.id, topic, envelope.attempts, envelope.max_attempts, reason
                        );

                        let member = match serde_json::to_vec(&envelope) {
                            Ok(m) => m,
                            Err(e) => {
                                error!("Failed to serialize retry envelope: {}", e);
                                continue;
                            }
                        };
                        let ready_at = Self::now_ms() + delay.as_millis() as u64;

                        let mut pipe = redis::pipe();
                        pipe.zadd(self.delayed_key(&topic), member, ready_at).ignore();
                        pipe.xack(&stream_key, &self.group_id, &[&entry_id]).ignore();
                        pipe.cmd("XDEL").arg(&stream_key).arg(&entry_id).ignore();
                        if let Err(e) = pipe.query_async::<()>(&mut conn).await {
                            error!("Failed to requeue {}: {}", msg.delivery_id, e);
                        } else {
                            counter!("queue_retry_total", "topic" => topic).increment(1);
                        }
                    }
                    AckAction::Dead { reason } => {
                        let payload = serde_json::to_vec(&msg.envelope).unwrap_or_default();
                        let result: redis::RedisResult<i64> = dead_script
                            .key(&stream_key)
                            .key(&self.group_id)
                            .key(self.dlq_key(&topic))
                            .arg(payload.as_slice())
                            .arg(&reason)
                            .arg(&entry_id)
                            .invoke_async(&mut conn)
                            .await;

                        if let Err(e) = result {
                            error!("Failed to dead-letter {}: {}", msg.delivery_id, e);
                        } else {
                            counter!("queue_dlq_total", "topic" => topic.clone()).increment(1);
                        }
                        if msg.envelope.dedup {
                            let _: std::result::Result<(), _> =
                                conn.del(self.dedup_key(&topic, &msg.envelope.id)).await;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, topic: &str, envelope: JobEnvelope, delay: Duration) -> Result<bool> {
        let mut conn = self.get_connection().await?;

        if envelope.dedup {
            let key = self.dedup_key(topic, &envelope.id);
            // Cleared on ack/dead; the 48h cap only covers abandoned chains.
            let claimed: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(48 * 3600)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::PushFailed(Box::new(e)))?;
            if claimed.is_none() {
                debug!("Deduplicated job {} on {}", envelope.id, topic);
                counter!("queue_dedup_total", "topic" => topic.to_string()).increment(1);
                return Ok(false);
            }
        }

        let payload =
            serde_json::to_vec(&envelope).map_err(|e| QueueError::SerializationFailed(Box::new(e)))?;

        if delay > Duration::ZERO {
            let ready_at = Self::now_ms() + delay.as_millis() as u64;
            let _: () = conn
                .zadd(self.delayed_key(topic), payload, ready_at)
                .await
                .map_err(|e| QueueError::PushFailed(Box::new(e)))?;
        } else {
            let _: String = redis::cmd("XADD")
                .arg(self.stream_key(topic))
                .arg("*")
                .arg("payload")
                .arg(payload)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::PushFailed(Box::new(e)))?;
        }

        counter!("queue_publish_total", "topic" => topic.to_string()).increment(1);
        Ok(true)
    }

    async fn subscribe(&self, topic: &str, sender: mpsc::Sender<Delivery>) -> Result<()> {
        let stream_key = self.stream_key(topic);
        let mut conn = self.get_connection().await?;
        let mut router = self.router.write().await;

        router.routes.insert(stream_key.clone(), sender);

        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(
                stream_key.as_str(),
                self.group_id.as_str(),
                "$",
            )
            .await
        {
            Ok(_) => info!("Created consumer group {} for {}", self.group_id, stream_key),
            Err(e) => {
                if e.code() != Some("BUSYGROUP") {
                    error!("Failed to create consumer group for {}: {}", stream_key, e);
                    return Err(QueueError::OperationFailed(Box::new(e)).into());
                }
            }
        }

        Ok(())
    }

    async fn renew(&self, delivery_id: &str) -> Result<()> {
        let Some((stream_key, entry_id)) = delivery_id.split_once('@') else {
            return Err(QueueError::OperationFailed(
                format!("invalid delivery id: {delivery_id}").into(),
            )
            .into());
        };
        let mut conn = self.get_connection().await?;
        // XCLAIM with idle 0 resets the entry's idle clock.
        let _: redis::Value = redis::cmd("XCLAIM")
            .arg(stream_key)
            .arg(&self.group_id)
            .arg(&self.consumer_name)
            .arg(0)
            .arg(entry_id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::OperationFailed(Box::new(e)))?;
        Ok(())
    }

    async fn remove_delayed(&self, topic: &str, job_id: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let members: Vec<Vec<u8>> = conn
            .zrange(self.delayed_key(topic), 0, -1)
            .await
            .map_err(|e| QueueError::OperationFailed(Box::new(e)))?;

        for member in members {
            let Some(envelope) = Self::parse_envelope(&member) else {
                continue;
            };
            if envelope.id == job_id {
                let mut pipe = redis::pipe();
                pipe.zrem(self.delayed_key(topic), member).ignore();
                if envelope.dedup {
                    pipe.del(self.dedup_key(topic, job_id)).ignore();
                }
                pipe.query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| QueueError::OperationFailed(Box::new(e)))?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn scheduled_jobs(&self, topic: &str) -> Result<Vec<JobEnvelope>> {
        let mut conn = self.get_connection().await?;
        let members: Vec<Vec<u8>> = conn
            .zrange(self.delayed_key(topic), 0, -1)
            .await
            .map_err(|e| QueueError::OperationFailed(Box::new(e)))?;
        Ok(members
            .iter()
            .filter_map(|m| Self::parse_envelope(m))
            .collect())
    }

    async fn read_dlq(&self, topic: &str, count: usize) -> Result<Vec<(String, JobEnvelope, String)>> {
        let mut conn = self.get_connection().await?;

        let result: redis::RedisResult<Vec<(String, HashMap<String, Vec<u8>>)>> =
            redis::cmd("XREVRANGE")
                .arg(self.dlq_key(topic))
                .arg("+")
                .arg("-")
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await;

        match result {
            Ok(messages) => {
                let mut output = Vec::new();
                for (id, map) in messages {
                    let Some(envelope) = map.get("payload").and_then(|p| Self::parse_envelope(p))
                    else {
                        continue;
                    };
                    let reason = map
                        .get("reason")
                        .and_then(|r| String::from_utf8(r.clone()).ok())
                        .unwrap_or_default();
                    output.push((id, envelope, reason));
                }
                Ok(output)
            }
            Err(e) => {
                warn!("Error reading DLQ for {}: {}", topic, e);
                Ok(Vec::new())
            }
        }
    }

    async fn clean_storage(&self) -> Result<()> {
        if self.settings.retention_hours == 0 {
            return Ok(());
        }

        let keys: Vec<String> = {
            let r = self.router.read().await;
            r.routes.keys().cloned().collect()
        };
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.get_connection().await?;
        let min_id = Self::now_ms().saturating_sub(self.settings.retention_hours * 3_600_000);

        for stream_key in keys {
            for key in [stream_key.clone(), format!("{}:dlq", stream_key)] {
                let trimmed: redis::RedisResult<i64> = redis::cmd("XTRIM")
                    .arg(&key)
                    .arg("MINID")
                    .arg("~")
                    .arg(min_id)
                    .query_async(&mut conn)
                    .await;
                if let Ok(n) = trimmed {
                    if n > 0 {
                        debug!("Trimmed {} aged entries from {}", n, key);
                    }
                }
            }
        }
        Ok(())
    }
}
