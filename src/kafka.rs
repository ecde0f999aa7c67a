//! Kafka plumbing: consumer/producer construction and the event publisher
//! that serializes record batches onto the bus. Delivery is at-least-once;
//! replays are tolerated downstream.

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::events::{
    routes, BalanceOut, CancelOrderOut, Envelope, EventBatch, EventKind, OrderOut, PositionOut,
    Queue, SubTradeOut, TradeOut,
};
use crate::models::Order;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub fn create_producer(brokers: &str) -> Result<FutureProducer, KafkaError> {
    ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "5000")
        .create()
}

pub fn create_consumer(brokers: &str, group: &str) -> Result<StreamConsumer, KafkaError> {
    ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", group)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", "latest")
        .create()
}

#[derive(Clone)]
pub struct EventPublisher {
    producer: FutureProducer,
    match_topic: String,
    publish_topic: String,
    clock: Clock,
}

impl EventPublisher {
    pub fn new(producer: FutureProducer, match_topic: String, publish_topic: String, clock: Clock) -> Self {
        Self {
            producer,
            match_topic,
            publish_topic,
            clock,
        }
    }

    /// Emit a freshly accepted order to the match queue (keyed by symbol)
    /// and the publish queue (keyed by account).
    pub async fn publish_send_order(&self, order: &Order) -> Result<(), EngineError> {
        self.produce(EventKind::SendOrder, &order.symbol, order.account_id, &OrderOut::from(order))
            .await
    }

    /// Emit a cancel request to the match queue. The payload carries no
    /// status; that is how the engine tells a cancel from a send.
    pub async fn publish_cancel_order(&self, order: &Order) -> Result<(), EngineError> {
        self.produce(
            EventKind::CancelOrder,
            &order.symbol,
            order.account_id,
            &CancelOrderOut::from(order),
        )
        .await
    }

    /// Publish everything one engine pass produced, in the same order the
    /// records were written.
    pub async fn publish_batch(&self, batch: &EventBatch) -> Result<(), EngineError> {
        for order in &batch.orders {
            self.produce(EventKind::UpdateOrder, &order.symbol, order.account_id, &OrderOut::from(order))
                .await?;
        }
        for sub_trade in &batch.sub_trades {
            let Some(trade) = batch.trades.iter().find(|t| t.id == sub_trade.trade_id) else {
                continue;
            };
            self.produce(
                EventKind::SubTrade,
                &batch.symbol,
                sub_trade.account_id,
                &SubTradeOut::new(sub_trade, trade),
            )
            .await?;
        }
        for trade in &batch.trades {
            self.produce(EventKind::Trade, &batch.symbol, Uuid::nil(), &TradeOut::from(trade))
                .await?;
        }
        for level in &batch.book_levels {
            self.produce(EventKind::OrderBook, &batch.symbol, Uuid::nil(), level).await?;
        }
        for balance in &batch.balances {
            self.produce(EventKind::Balance, &batch.symbol, balance.account_id, &BalanceOut::from(balance))
                .await?;
        }
        for position in &batch.positions {
            self.produce(
                EventKind::Position,
                &position.symbol,
                position.account_id,
                &PositionOut::from(position),
            )
            .await?;
        }
        Ok(())
    }

    /// Push a raw inbound message back onto the match queue after a lock
    /// conflict, preserving its partition key.
    pub async fn requeue(&self, key: Option<&[u8]>, payload: &[u8]) -> Result<(), EngineError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(&self.match_topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        self.producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(err, _)| EngineError::Publish(err.to_string()))?;
        Ok(())
    }

    async fn produce<T: Serialize>(
        &self,
        kind: EventKind,
        symbol: &str,
        account_id: Uuid,
        event: &T,
    ) -> Result<(), EngineError> {
        for route in routes(kind, symbol, account_id) {
            let envelope = Envelope {
                topic: route.topic.clone(),
                key: route.key.clone(),
                timestamp: self.clock.now_ms(),
                event,
            };
            let payload =
                serde_json::to_vec(&envelope).map_err(|err| EngineError::Publish(err.to_string()))?;
            let queue_topic = match route.queue {
                Queue::Match => &self.match_topic,
                Queue::Publish => &self.publish_topic,
            };
            let record = FutureRecord::to(queue_topic).key(&route.key).payload(&payload);
            self.producer
                .send(record, Timeout::After(SEND_TIMEOUT))
                .await
                .map_err(|(err, _)| EngineError::Publish(err.to_string()))?;
        }
        Ok(())
    }
}
