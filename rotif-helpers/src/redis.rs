use std::fmt::Debug;

use redis::{
    aio::MultiplexedConnection,
    cluster::ClusterClientBuilder,
    cluster_async::ClusterConnection,
    streams::{
        StreamClaimOptions, StreamClaimReply, StreamPendingCountReply, StreamRangeReply,
        StreamReadOptions, StreamReadReply,
    },
    AsyncCommands, Client, FromRedisValue, Pipeline, RedisResult, Script, ToRedisArgs,
};
use tokio::sync::mpsc::UnboundedSender;

/// Configuration for a Redis connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// The nodes to use to connect to the Redis cluster or instance.
    pub nodes: Vec<String>,
    /// The password to use to connect to the Redis cluster or instance.
    pub password: Option<String>,
    /// Whether to use cluster mode for the Redis connection.
    pub cluster_mode: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            nodes: vec!["redis://127.0.0.1:6379/?protocol=resp3".to_string()],
            password: None,
            cluster_mode: false,
        }
    }
}

/// A simplified choice of strategies for the xtrim command.
#[derive(Debug, Clone)]
pub enum StreamTrimStrategy {
    MaxLen(usize),
    MinId(String),
}

/// A wrapper around a Redis connection that can be used to talk to either
/// a single node or a cluster through a single set of method calls.
///
/// This provides a unified interface for the subset of Redis commands used
/// by the Rotif broker: streams, sorted sets, scripts and pub/sub.
pub enum ConnectionWrapper {
    Cluster(ClusterConnection),
    SingleNode(MultiplexedConnection),
}

impl Debug for ConnectionWrapper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConnectionWrapper::Cluster(_) => write!(f, "ConnectionWrapper::Cluster"),
            ConnectionWrapper::SingleNode(_) => write!(f, "ConnectionWrapper::SingleNode"),
        }
    }
}

impl Clone for ConnectionWrapper {
    fn clone(&self) -> Self {
        match self {
            ConnectionWrapper::Cluster(conn) => ConnectionWrapper::Cluster(conn.clone()),
            ConnectionWrapper::SingleNode(conn) => ConnectionWrapper::SingleNode(conn.clone()),
        }
    }
}

impl ConnectionWrapper {
    pub async fn get(&mut self, key: &str) -> RedisResult<Option<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.get(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.get(key).await,
        }
    }

    /// Set the value and expiration of a key, in milliseconds, only if the
    /// key does not already exist.
    /// [Redis Docs](https://redis.io/commands/set)
    ///
    /// Returns `true` if the key was set, `false` if the key already existed.
    pub async fn pset_ex_nx(
        &mut self,
        key: &str,
        value: &str,
        expire_ms: u64,
    ) -> RedisResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(expire_ms);

        let result: Option<String> = match self {
            ConnectionWrapper::Cluster(conn) => cmd.query_async(conn).await?,
            ConnectionWrapper::SingleNode(conn) => cmd.query_async(conn).await?,
        };

        Ok(result.is_some())
    }

    pub async fn del(&mut self, key: &str) -> RedisResult<i64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.del(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.del(key).await,
        }
    }

    pub async fn expire(&mut self, key: &str, seconds: i64) -> RedisResult<bool> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.expire(key, seconds).await,
            ConnectionWrapper::SingleNode(conn) => conn.expire(key, seconds).await,
        }
    }

    pub async fn zadd(&mut self, key: &str, member: &str, score: f64) -> RedisResult<()> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.zadd(key, member, score).await,
            ConnectionWrapper::SingleNode(conn) => conn.zadd(key, member, score).await,
        }
    }

    pub async fn zrem(&mut self, key: &str, member: &str) -> RedisResult<i64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.zrem(key, member).await,
            ConnectionWrapper::SingleNode(conn) => conn.zrem(key, member).await,
        }
    }

    pub async fn zincrby(&mut self, key: &str, member: &str, delta: f64) -> RedisResult<f64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.zincr(key, member, delta).await,
            ConnectionWrapper::SingleNode(conn) => conn.zincr(key, member, delta).await,
        }
    }

    /// `ZRANGEBYSCORE key min max LIMIT 0 count`, returning members only.
    pub async fn zrangebyscore_limit(
        &mut self,
        key: &str,
        min: f64,
        max: f64,
        count: isize,
    ) -> RedisResult<Vec<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => {
                conn.zrangebyscore_limit(key, min, max, 0, count).await
            }
            ConnectionWrapper::SingleNode(conn) => {
                conn.zrangebyscore_limit(key, min, max, 0, count).await
            }
        }
    }

    /// `ZRANGEBYSCORE key min +inf`, used to resync the active pattern set.
    pub async fn zrangebyscore_withscores(
        &mut self,
        key: &str,
        min: f64,
    ) -> RedisResult<Vec<(String, f64)>> {
        match self {
            ConnectionWrapper::Cluster(conn) => {
                conn.zrangebyscore_withscores(key, min, "+inf").await
            }
            ConnectionWrapper::SingleNode(conn) => {
                conn.zrangebyscore_withscores(key, min, "+inf").await
            }
        }
    }

    /// Evaluates a Lua script, relying on `redis::Script`'s built-in
    /// `EVALSHA`-then-`EVAL` fallback so callers never have to handle
    /// `NOSCRIPT` themselves.
    pub async fn eval_script<T: FromRedisValue>(
        &mut self,
        script: &Script,
        keys: &[&str],
        args: &[String],
    ) -> RedisResult<T> {
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        match self {
            ConnectionWrapper::Cluster(conn) => invocation.invoke_async(conn).await,
            ConnectionWrapper::SingleNode(conn) => invocation.invoke_async(conn).await,
        }
    }

    /// Executes a pipeline of commands asynchronously.
    /// [Redis Docs](https://redis.io/docs/latest/reference/pipelining/)
    pub async fn query_pipeline_async(
        &mut self,
        pipeline: &mut Pipeline,
    ) -> RedisResult<Vec<Option<String>>> {
        match self {
            ConnectionWrapper::Cluster(conn) => pipeline.query_async(conn).await,
            ConnectionWrapper::SingleNode(conn) => pipeline.query_async(conn).await,
        }
    }

    /// Reads messages from the specified streams.
    /// [Redis Docs](https://redis.io/commands/xread)
    pub async fn xread(
        &mut self,
        streams: &[&str],
        offset_ids: &[&str],
        count: usize,
        block_time_ms: usize,
    ) -> RedisResult<StreamReadReply> {
        let options = StreamReadOptions::default()
            .count(count)
            .block(block_time_ms);

        match self {
            ConnectionWrapper::Cluster(conn) => {
                conn.xread_options(streams, offset_ids, &options).await
            }
            ConnectionWrapper::SingleNode(conn) => {
                conn.xread_options(streams, offset_ids, &options).await
            }
        }
    }

    /// `XREADGROUP GROUP group consumer COUNT count BLOCK block_ms STREAMS stream >`
    /// [Redis Docs](https://redis.io/commands/xreadgroup)
    pub async fn xreadgroup(
        &mut self,
        group: &str,
        consumer: &str,
        stream: &str,
        count: usize,
        block_time_ms: usize,
    ) -> RedisResult<StreamReadReply> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_time_ms);

        match self {
            ConnectionWrapper::Cluster(conn) => {
                conn.xread_options(&[stream], &[">"], &options).await
            }
            ConnectionWrapper::SingleNode(conn) => {
                conn.xread_options(&[stream], &[">"], &options).await
            }
        }
    }

    /// Creates a consumer group for a stream, creating the stream itself if
    /// it does not already exist. `BUSYGROUP` (the group already exists) is
    /// swallowed rather than surfaced as an error.
    /// [Redis Docs](https://redis.io/commands/xgroup-create)
    pub async fn xgroup_create_mkstream(&mut self, stream: &str, group: &str) -> RedisResult<()> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg("0").arg("MKSTREAM");

        let result = match self {
            ConnectionWrapper::Cluster(conn) => cmd.query_async::<()>(conn).await,
            ConnectionWrapper::SingleNode(conn) => cmd.query_async::<()>(conn).await,
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Adds a message to the specified stream.
    /// [Redis Docs](https://redis.io/commands/xadd)
    pub async fn xadd<V: ToRedisArgs + Send + Sync>(
        &mut self,
        stream_name: &str,
        id: &str,
        values: &[(&str, V)],
    ) -> RedisResult<String> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.xadd(stream_name, id, values).await,
            ConnectionWrapper::SingleNode(conn) => conn.xadd(stream_name, id, values).await,
        }
    }

    /// Acknowledges one or more messages for a consumer group.
    /// [Redis Docs](https://redis.io/commands/xack)
    pub async fn xack(&mut self, stream: &str, group: &str, ids: &[&str]) -> RedisResult<i64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.xack(stream, group, ids).await,
            ConnectionWrapper::SingleNode(conn) => conn.xack(stream, group, ids).await,
        }
    }

    /// Deletes one or more entries from a stream.
    /// [Redis Docs](https://redis.io/commands/xdel)
    pub async fn xdel(&mut self, stream: &str, ids: &[&str]) -> RedisResult<i64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.xdel(stream, ids).await,
            ConnectionWrapper::SingleNode(conn) => conn.xdel(stream, ids).await,
        }
    }

    /// `XPENDING stream group IDLE idle_ms - + count`, listing entries idle
    /// for at least `idle_ms` so they can be reclaimed.
    /// [Redis Docs](https://redis.io/commands/xpending)
    pub async fn xpending_idle(
        &mut self,
        stream: &str,
        group: &str,
        idle_ms: u64,
        count: usize,
    ) -> RedisResult<StreamPendingCountReply> {
        match self {
            ConnectionWrapper::Cluster(conn) => {
                conn.xpending_consumer_idle_count(stream, group, None::<&str>, idle_ms, "-", "+", count)
                    .await
            }
            ConnectionWrapper::SingleNode(conn) => {
                conn.xpending_consumer_idle_count(stream, group, None::<&str>, idle_ms, "-", "+", count)
                    .await
            }
        }
    }

    /// Claims idle pending entries for the calling consumer.
    /// [Redis Docs](https://redis.io/commands/xclaim)
    pub async fn xclaim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[&str],
    ) -> RedisResult<StreamClaimReply> {
        let options = StreamClaimOptions::default();
        match self {
            ConnectionWrapper::Cluster(conn) => {
                conn.xclaim_options(stream, group, consumer, min_idle_ms, ids, options)
                    .await
            }
            ConnectionWrapper::SingleNode(conn) => {
                conn.xclaim_options(stream, group, consumer, min_idle_ms, ids, options)
                    .await
            }
        }
    }

    /// `XRANGE stream - + COUNT count`, used by DLQ cleanup to sweep in
    /// batches from the oldest entry forwards.
    /// [Redis Docs](https://redis.io/commands/xrange)
    pub async fn xrange_count(&mut self, stream: &str, count: usize) -> RedisResult<StreamRangeReply> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.xrange_count(stream, "-", "+", count).await,
            ConnectionWrapper::SingleNode(conn) => conn.xrange_count(stream, "-", "+", count).await,
        }
    }

    /// Trims the specified stream with the specified strategy.
    /// [Redis Docs](https://redis.io/commands/xtrim)
    pub async fn xtrim(&mut self, stream_name: &str, trim_strategy: StreamTrimStrategy) -> RedisResult<()> {
        use redis::streams::{StreamTrimOptions, StreamTrimmingMode};

        let options = match trim_strategy {
            StreamTrimStrategy::MaxLen(max_length) => {
                StreamTrimOptions::maxlen(StreamTrimmingMode::Exact, max_length)
            }
            StreamTrimStrategy::MinId(min_id) => {
                StreamTrimOptions::minid(StreamTrimmingMode::Exact, min_id)
            }
        };

        match self {
            ConnectionWrapper::Cluster(conn) => conn.xtrim_options(stream_name, &options).await,
            ConnectionWrapper::SingleNode(conn) => conn.xtrim_options(stream_name, &options).await,
        }
    }

    /// Returns the number of messages in the specified stream.
    /// [Redis Docs](https://redis.io/commands/xlen)
    pub async fn xlen(&mut self, stream_name: &str) -> RedisResult<usize> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.xlen(stream_name).await,
            ConnectionWrapper::SingleNode(conn) => conn.xlen(stream_name).await,
        }
    }

    /// Pushes one or more values onto the end of a list.
    /// [Redis Docs](https://redis.io/commands/rpush)
    pub async fn rpush(&mut self, key: &str, values: &[String]) -> RedisResult<i64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.rpush(key, values).await,
            ConnectionWrapper::SingleNode(conn) => conn.rpush(key, values).await,
        }
    }

    /// Subscribes to a channel.
    ///
    /// Updates are delivered on the push sender the connection was built
    /// with. Only available when the connection uses the RESP3 protocol.
    pub async fn subscribe(&mut self, channel_name: &str) -> RedisResult<()> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.subscribe(channel_name).await,
            ConnectionWrapper::SingleNode(conn) => conn.subscribe(channel_name).await,
        }
    }

    /// Posts a message to the given channel.
    /// [Redis Docs](https://redis.io/commands/publish)
    pub async fn publish(&mut self, channel_name: &str, message: String) -> RedisResult<i64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.publish(channel_name, message).await,
            ConnectionWrapper::SingleNode(conn) => conn.publish(channel_name, message).await,
        }
    }
}

/// Creates a connection to a Redis cluster or instance.
///
/// If `redis_tx` is provided, the connection is configured to push
/// `PushInfo` notifications (used for pub/sub) to that sender.
pub async fn get_redis_connection(
    conn_config: &ConnectionConfig,
    redis_tx: Option<UnboundedSender<redis::PushInfo>>,
) -> RedisResult<ConnectionWrapper> {
    if !conn_config.cluster_mode {
        let client = Client::open(conn_config.nodes[0].clone())?;
        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(redis_tx) = redis_tx {
            config = config.set_push_sender(redis_tx);
        }
        return Ok(ConnectionWrapper::SingleNode(
            client
                .get_multiplexed_async_connection_with_config(&config)
                .await?,
        ));
    }

    let mut builder = ClusterClientBuilder::new(conn_config.nodes.clone())
        .use_protocol(redis::ProtocolVersion::RESP3);

    if let Some(password) = conn_config.password.clone() {
        builder = builder.password(password);
    }

    let client = if let Some(redis_tx) = redis_tx {
        builder.push_sender(redis_tx).build()?
    } else {
        builder.build()?
    };

    Ok(ConnectionWrapper::Cluster(
        client.get_async_connection().await?,
    ))
}
