//! Typed event records produced by one engine pass, plus the routing table
//! that maps each event kind onto a queue, topic and partition key.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Balance, Order, OrderStatus, OrderType, Position, Side, SubTrade, Trade};
use crate::orderbook::BookLevel;

pub const TOPIC_ORDER_UPDATE: &str = "OrderUpdate";
pub const TOPIC_TRADE: &str = "trade";
pub const TOPIC_ACCOUNT_TRADE: &str = "accountTrade";
pub const TOPIC_BALANCE: &str = "balance";
pub const TOPIC_POSITION: &str = "position";
pub const TOPIC_ORDER_BOOK: &str = "orderBook";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SendOrder,
    CancelOrder,
    UpdateOrder,
    Trade,
    SubTrade,
    Balance,
    Position,
    OrderBook,
}

/// Which Kafka queue an envelope goes to. The match queue feeds the engine
/// itself (partitioned by symbol); the publish queue feeds downstream
/// consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Match,
    Publish,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub queue: Queue,
    pub topic: String,
    pub key: String,
}

/// The routing table of the event bus. A send-order fans out to both queues;
/// everything else goes to exactly one.
pub fn routes(kind: EventKind, symbol: &str, account_id: Uuid) -> Vec<Route> {
    match kind {
        EventKind::SendOrder => vec![
            Route {
                queue: Queue::Match,
                topic: TOPIC_ORDER_UPDATE.to_string(),
                key: symbol.to_string(),
            },
            Route {
                queue: Queue::Publish,
                topic: TOPIC_ORDER_UPDATE.to_string(),
                key: account_id.to_string(),
            },
        ],
        EventKind::CancelOrder => vec![Route {
            queue: Queue::Match,
            topic: TOPIC_ORDER_UPDATE.to_string(),
            key: symbol.to_string(),
        }],
        EventKind::UpdateOrder => vec![Route {
            queue: Queue::Publish,
            topic: TOPIC_ORDER_UPDATE.to_string(),
            key: account_id.to_string(),
        }],
        EventKind::Trade => vec![Route {
            queue: Queue::Publish,
            topic: TOPIC_TRADE.to_string(),
            key: format!("{symbol}:{TOPIC_TRADE}"),
        }],
        EventKind::SubTrade => vec![Route {
            queue: Queue::Publish,
            topic: TOPIC_ACCOUNT_TRADE.to_string(),
            key: account_id.to_string(),
        }],
        EventKind::Balance => vec![Route {
            queue: Queue::Publish,
            topic: TOPIC_BALANCE.to_string(),
            key: account_id.to_string(),
        }],
        EventKind::Position => vec![Route {
            queue: Queue::Publish,
            topic: TOPIC_POSITION.to_string(),
            key: account_id.to_string(),
        }],
        EventKind::OrderBook => vec![Route {
            queue: Queue::Publish,
            topic: format!("{symbol}:{TOPIC_ORDER_BOOK}"),
            key: format!("{symbol}:{TOPIC_ORDER_BOOK}"),
        }],
    }
}

/// Wire envelope: `{topic, key, timestamp, event}` with a producer timestamp
/// in milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: Serialize> {
    pub topic: String,
    pub key: String,
    pub timestamp: i64,
    pub event: T,
}

/// Inbound order snapshot on the match queue. Only the identifier and status
/// matter; the engine re-reads the row under lock. Cancel requests carry no
/// status at all.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderEvent {
    pub id: Uuid,
    #[serde(default)]
    pub status: Option<OrderStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    pub topic: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub event: OrderEvent,
}

// ---------------------------------------------------------------------------
// Outbound payloads. Decimals serialize as strings, identifiers as canonical
// UUIDs, row timestamps as RFC 3339.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct OrderOut {
    pub id: Uuid,
    pub account_id: Uuid,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub post_only: bool,
    pub reduce_only: bool,
    pub price: Decimal,
    pub quantity: Decimal,
    pub quote_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub filled_quote: Decimal,
    pub leverage: i32,
    pub insert_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl From<&Order> for OrderOut {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            account_id: order.account_id,
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            status: order.status,
            post_only: order.post_only,
            reduce_only: order.reduce_only,
            price: order.price,
            quantity: order.quantity,
            quote_quantity: order.quote_quantity,
            filled_quantity: order.filled_quantity,
            filled_quote: order.filled_quote,
            leverage: order.leverage,
            insert_time: order.insert_time,
            update_time: order.update_time,
        }
    }
}

/// Cancel request payload: carries no status, which is what distinguishes it
/// from a send on the match queue.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOrderOut {
    pub id: Uuid,
    pub symbol: String,
}

impl From<&Order> for CancelOrderOut {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            symbol: order.symbol.clone(),
        }
    }
}

/// Public trade feed payload; carries no order or account identifiers.
#[derive(Debug, Clone, Serialize)]
pub struct TradeOut {
    pub id: Uuid,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub insert_time: DateTime<Utc>,
}

impl From<&Trade> for TradeOut {
    fn from(trade: &Trade) -> Self {
        Self {
            id: trade.id,
            symbol: trade.symbol.clone(),
            price: trade.price,
            quantity: trade.quantity,
            insert_time: trade.insert_time,
        }
    }
}

/// Private per-account fill payload.
#[derive(Debug, Clone, Serialize)]
pub struct SubTradeOut {
    pub id: Uuid,
    pub order_id: Uuid,
    pub account_id: Uuid,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub quote_quantity: Decimal,
    pub commission: Decimal,
    pub commission_asset: String,
    pub side: Side,
    pub is_maker: bool,
    pub insert_time: DateTime<Utc>,
}

impl SubTradeOut {
    pub fn new(sub_trade: &SubTrade, trade: &Trade) -> Self {
        Self {
            id: sub_trade.id,
            order_id: sub_trade.order_id,
            account_id: sub_trade.account_id,
            symbol: trade.symbol.clone(),
            price: trade.price,
            quantity: trade.quantity,
            quote_quantity: trade.quote_quantity,
            commission: sub_trade.commission,
            commission_asset: sub_trade.commission_asset.clone(),
            side: sub_trade.side,
            is_maker: sub_trade.is_maker,
            insert_time: trade.insert_time,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceOut {
    pub account_id: Uuid,
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl From<&Balance> for BalanceOut {
    fn from(balance: &Balance) -> Self {
        Self {
            account_id: balance.account_id,
            asset: balance.asset.clone(),
            free: balance.free,
            locked: balance.locked,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionOut {
    pub id: Uuid,
    pub account_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub margin: Decimal,
    pub leverage: i32,
    pub entry_price: Decimal,
    pub liquidation_price: Decimal,
}

impl From<&Position> for PositionOut {
    fn from(position: &Position) -> Self {
        Self {
            id: position.id,
            account_id: position.account_id,
            symbol: position.symbol.clone(),
            side: position.side,
            size: position.size(),
            margin: position.margin,
            leverage: position.leverage,
            entry_price: position.entry_price,
            liquidation_price: position.liquidation_price,
        }
    }
}

/// Everything one engine pass produced, in insertion order. The publisher
/// takes this structure directly.
#[derive(Debug, Default)]
pub struct EventBatch {
    pub symbol: String,
    pub orders: Vec<Order>,
    pub trades: Vec<Trade>,
    pub sub_trades: Vec<SubTrade>,
    pub balances: Vec<Balance>,
    pub positions: Vec<Position>,
    pub book_levels: Vec<BookLevel>,
}

impl EventBatch {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            ..Self::default()
        }
    }

    /// Keep the latest snapshot per balance row; a multi-fill event touches
    /// the same account repeatedly.
    pub fn push_balance(&mut self, balance: Balance) {
        self.balances.retain(|b| b.id != balance.id);
        self.balances.push(balance);
    }

    pub fn push_position(&mut self, position: Position) {
        self.positions.retain(|p| p.id != position.id);
        self.positions.push(position);
    }

    /// The (side, price) levels an event touched: each maker fill price on
    /// the maker side, plus the taker's own level when it has a price.
    pub fn affected_levels(&self, inbound: &Order) -> Vec<(Side, Decimal)> {
        let maker_side = inbound.side.opposite();
        let mut levels: Vec<(Side, Decimal)> = Vec::new();
        for trade in &self.trades {
            if !levels.contains(&(maker_side, trade.price)) {
                levels.push((maker_side, trade.price));
            }
        }
        if inbound.price > Decimal::ZERO && !levels.contains(&(inbound.side, inbound.price)) {
            levels.push((inbound.side, inbound.price));
        }
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn send_order_fans_out_to_both_queues() {
        let account = Uuid::new_v4();
        let routed = routes(EventKind::SendOrder, "BTCUSDT", account);
        assert_eq!(routed.len(), 2);
        assert_eq!(routed[0].queue, Queue::Match);
        assert_eq!(routed[0].key, "BTCUSDT");
        assert_eq!(routed[1].queue, Queue::Publish);
        assert_eq!(routed[1].key, account.to_string());
    }

    #[test]
    fn cancel_order_goes_to_match_queue_keyed_by_symbol() {
        let routed = routes(EventKind::CancelOrder, "BTCUSDT", Uuid::new_v4());
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].queue, Queue::Match);
        assert_eq!(routed[0].topic, TOPIC_ORDER_UPDATE);
        assert_eq!(routed[0].key, "BTCUSDT");
    }

    #[test]
    fn trade_key_includes_symbol() {
        let routed = routes(EventKind::Trade, "BTCUSDT", Uuid::new_v4());
        assert_eq!(routed[0].key, "BTCUSDT:trade");
        assert_eq!(routed[0].topic, "trade");
    }

    #[test]
    fn order_book_topic_is_per_symbol() {
        let routed = routes(EventKind::OrderBook, "ETHUSDT", Uuid::new_v4());
        assert_eq!(routed[0].topic, "ETHUSDT:orderBook");
        assert_eq!(routed[0].key, "ETHUSDT:orderBook");
    }

    #[test]
    fn account_scoped_kinds_key_by_account() {
        let account = Uuid::new_v4();
        for kind in [EventKind::UpdateOrder, EventKind::SubTrade, EventKind::Balance, EventKind::Position] {
            let routed = routes(kind, "BTCUSDT", account);
            assert_eq!(routed.len(), 1);
            assert_eq!(routed[0].queue, Queue::Publish);
            assert_eq!(routed[0].key, account.to_string());
        }
    }

    #[test]
    fn decimal_payloads_serialize_as_strings() {
        let level = BookLevel {
            side: Side::Long,
            price: dec!(100.5),
            quantity: dec!(2),
        };
        let json = serde_json::to_value(&level).unwrap();
        assert_eq!(json["price"], serde_json::json!("100.5"));
        assert_eq!(json["side"], serde_json::json!("LONG"));
    }
}
