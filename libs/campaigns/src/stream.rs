//! Thin wrapper over the Redis stream: publish, group reads, acks, and
//! reclaim of entries a dead consumer left pending.

use omc_core::{Error, Result};
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use uuid::Uuid;

use crate::{GROUP_NAME, STREAM_NAME};

const READ_BLOCK_MS: usize = 2_000;
/// Entries pending longer than this on a dead consumer are reclaimed.
pub const RECLAIM_MIN_IDLE_MS: usize = 15 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub campaign_id: Uuid,
}

/// One consumer's connection into the group. Each worker holds its own so
/// blocking reads never stall a shared connection.
pub struct CampaignStream {
    conn: redis::aio::MultiplexedConnection,
    consumer: String,
}

impl CampaignStream {
    pub async fn connect(client: &redis::Client, consumer: impl Into<String>) -> Result<Self> {
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(redis_err)?;
        let mut stream = Self {
            conn,
            consumer: consumer.into(),
        };
        stream.ensure_group().await?;
        Ok(stream)
    }

    /// Creates the consumer group (and the stream) if missing; an existing
    /// group is fine.
    async fn ensure_group(&mut self) -> Result<()> {
        let created: std::result::Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(STREAM_NAME)
            .arg(GROUP_NAME)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(redis_err(err)),
        }
    }

    /// Publishes a campaign id for the workers.
    pub async fn publish(&mut self, campaign_id: Uuid) -> Result<String> {
        let entry_id: String = self
            .conn
            .xadd(
                STREAM_NAME,
                "*",
                &[("campaign_id", campaign_id.to_string())],
            )
            .await
            .map_err(redis_err)?;
        Ok(entry_id)
    }

    /// Blocking group read of the next undelivered entry, `None` on timeout.
    pub async fn next(&mut self) -> Result<Option<StreamEntry>> {
        let options = StreamReadOptions::default()
            .group(GROUP_NAME, &self.consumer)
            .count(1)
            .block(READ_BLOCK_MS);
        let reply: StreamReadReply = self
            .conn
            .xread_options(&[STREAM_NAME], &[">"], &options)
            .await
            .map_err(redis_err)?;
        Ok(first_entry(reply))
    }

    /// Acks an entry once the recipient batch work behind it is committed.
    pub async fn ack(&mut self, entry_id: &str) -> Result<()> {
        let _: i64 = self
            .conn
            .xack(STREAM_NAME, GROUP_NAME, &[entry_id])
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    /// Claims entries another consumer took but never acked within the
    /// grace period. This is what makes a worker crash recoverable.
    pub async fn reclaim_stale(&mut self, count: usize) -> Result<Vec<StreamEntry>> {
        let options = StreamAutoClaimOptions::default().count(count);
        let reply: StreamAutoClaimReply = self
            .conn
            .xautoclaim_options(
                STREAM_NAME,
                GROUP_NAME,
                &self.consumer,
                RECLAIM_MIN_IDLE_MS,
                "0-0",
                options,
            )
            .await
            .map_err(redis_err)?;

        let mut entries = Vec::new();
        for id in reply.claimed {
            if let Some(entry) = parse_entry(&id) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

fn first_entry(reply: StreamReadReply) -> Option<StreamEntry> {
    for key in reply.keys {
        for id in key.ids {
            if let Some(entry) = parse_entry(&id) {
                return Some(entry);
            }
        }
    }
    None
}

fn parse_entry(id: &redis::streams::StreamId) -> Option<StreamEntry> {
    let raw: String = id.get("campaign_id")?;
    match raw.parse::<Uuid>() {
        Ok(campaign_id) => Some(StreamEntry {
            id: id.id.clone(),
            campaign_id,
        }),
        Err(_) => {
            tracing::warn!(entry = %id.id, payload = %raw, "unparseable campaign id on stream");
            None
        }
    }
}

fn redis_err(err: redis::RedisError) -> Error {
    Error::internal("redis stream error").with_source(err)
}
