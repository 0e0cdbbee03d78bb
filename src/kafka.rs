// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Kafka publishing: the JSON envelope every downstream consumer sees, topic
//! bootstrap, batched all-acks sends, and tail-offset reads.
//!
//! The message key is `"{chain_id}:{event_type}"`, which preserves
//! per-chain per-type ordering on partitioned topics. Delivery is
//! at-least-once: consumers dedupe on `(chain_id, tx_hash, log_index)`.

use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{IndexerError, IndexerResult};

/// Number of times to check that a newly created topic is visible on the
/// broker before giving up.
const TOPIC_VERIFY_RETRIES: u32 = 10;
const TOPIC_VERIFY_INTERVAL: Duration = Duration::from_secs(1);

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PairCreated,
    GridCreated,
    OrderCreated,
    OrderFilled,
    OrderCancelled,
    GridCancelled,
    GridFeeChanged,
    ProfitWithdrawn,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PairCreated => "pair_created",
            EventType::GridCreated => "grid_created",
            EventType::OrderCreated => "order_created",
            EventType::OrderFilled => "order_filled",
            EventType::OrderCancelled => "order_cancelled",
            EventType::GridCancelled => "grid_cancelled",
            EventType::GridFeeChanged => "grid_fee_changed",
            EventType::ProfitWithdrawn => "profit_withdrawn",
        }
    }
}

/// Envelope for all bus messages.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub event_type: EventType,
    pub chain_id: i64,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
    pub timestamp: i64,
    pub data: EventData,
}

impl Message {
    pub fn key(&self) -> String {
        format!("{}:{}", self.chain_id, self.event_type.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventData {
    PairCreated(PairCreatedData),
    GridCreated(GridCreatedData),
    OrderCreated(OrderCreatedData),
    OrderFilled(OrderFilledData),
    OrderCancelled(OrderCancelledData),
    GridCancelled(GridCancelledData),
    GridFeeChanged(GridFeeChangedData),
    ProfitWithdrawn(ProfitWithdrawnData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairCreatedData {
    pub pair_id: i32,
    pub base_address: String,
    pub quote_address: String,
    pub base_symbol: String,
    pub quote_symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridCreatedData {
    pub grid_id: i64,
    pub owner: String,
    pub pair_id: i32,
    pub base_token: String,
    pub quote_token: String,
    pub ask_order_count: i32,
    pub bid_order_count: i32,
    pub initial_base_amount: String,
    pub initial_quote_amount: String,
    pub fee: i32,
    pub compound: bool,
    pub oneshot: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ask_price0: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ask_gap: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bid_price0: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bid_gap: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreatedData {
    pub order_id: String,
    pub grid_id: i64,
    pub pair_id: i32,
    pub is_ask: bool,
    pub amount: String,
    pub rev_amount: String,
    pub price: String,
    pub rev_price: String,
    pub initial_base_amount: String,
    pub initial_quote_amount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFilledData {
    pub order_id: String,
    pub grid_id: i64,
    pub taker: String,
    pub base_amt: String,
    pub quote_vol: String,
    pub order_amt: String,
    pub order_rev_amt: String,
    pub is_ask: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelledData {
    pub order_id: String,
    pub grid_id: i64,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridCancelledData {
    pub grid_id: i64,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridFeeChangedData {
    pub grid_id: i64,
    pub fee: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitWithdrawnData {
    pub grid_id: i64,
    pub quote: String,
    pub to: String,
    pub amount: String,
}

/// Create the topic if it does not exist and verify it is visible on the
/// broker. Called at startup so configuration errors surface early.
pub async fn ensure_topic(
    brokers: &[String],
    topic: &str,
    num_partitions: i32,
    replication_factor: i32,
) -> IndexerResult<()> {
    let num_partitions = num_partitions.max(1);
    let replication_factor = replication_factor.max(1);

    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", brokers.join(","))
        .create()?;

    if topic_visible(&admin, topic) {
        return Ok(());
    }

    let new_topic = NewTopic::new(
        topic,
        num_partitions,
        TopicReplication::Fixed(replication_factor),
    );
    let results = admin
        .create_topics(&[new_topic], &AdminOptions::new())
        .await?;
    for result in results {
        match result {
            Ok(_) => {}
            Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
            Err((name, code)) => {
                return Err(IndexerError::Kafka(format!(
                    "create topic {name}: {code}"
                )));
            }
        }
    }

    // Topic creation is asynchronous on some deployments; poll until the
    // broker metadata reflects the new topic.
    for _ in 0..TOPIC_VERIFY_RETRIES {
        tokio::time::sleep(TOPIC_VERIFY_INTERVAL).await;
        if topic_visible(&admin, topic) {
            return Ok(());
        }
    }

    Err(IndexerError::Kafka(format!(
        "topic {topic} was created but not visible after {TOPIC_VERIFY_RETRIES} verification attempts"
    )))
}

fn topic_visible(admin: &AdminClient<DefaultClientContext>, topic: &str) -> bool {
    let Ok(metadata) = admin.inner().fetch_metadata(Some(topic), METADATA_TIMEOUT) else {
        return false;
    };
    metadata
        .topics()
        .iter()
        .any(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty())
}

/// Publishes envelope messages to the configured topic.
pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaProducer {
    pub fn new(brokers: &[String], topic: &str) -> IndexerResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("acks", "all")
            .set("linger.ms", "10")
            .set("message.timeout.ms", "30000")
            .create()?;
        info!(topic, "kafka producer created");
        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }

    /// Send a batch of messages; every message must be acked or the whole
    /// call fails (and the caller's transaction rolls back).
    pub async fn send_batch(&self, messages: &[Message]) -> IndexerResult<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut deliveries = Vec::with_capacity(messages.len());
        for message in messages {
            let payload = serde_json::to_vec(message)
                .map_err(|e| IndexerError::Kafka(format!("marshal message: {e}")))?;
            let key = message.key();
            let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);
            let delivery = self
                .producer
                .send_result(record)
                .map_err(|(e, _)| IndexerError::Kafka(format!("enqueue message: {e}")))?;
            deliveries.push(delivery);
        }

        for delivery in deliveries {
            delivery
                .await
                .map_err(|_| IndexerError::Kafka("delivery channel cancelled".into()))?
                .map_err(|(e, _)| IndexerError::Kafka(format!("deliver message: {e}")))?;
        }

        debug!(count = messages.len(), "kafka batch sent");
        Ok(())
    }

    /// High watermark of partition 0, stored per chain so downstream
    /// consumers know how far the producer has written.
    pub fn tail_offset(&self) -> IndexerResult<i64> {
        let (_, high) = self
            .producer
            .client()
            .fetch_watermarks(&self.topic, 0, METADATA_TIMEOUT)?;
        Ok(high)
    }
}
