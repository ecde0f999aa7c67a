use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::{Order, Side};

/// One match between a maker and a taker order. Immutable after insert; the
/// price is always the maker's price.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Trade {
    pub id: Uuid,
    pub symbol: String,
    pub maker_order_id: Uuid,
    pub taker_order_id: Uuid,
    pub price: Decimal,
    pub quantity: Decimal,
    pub quote_quantity: Decimal,
    pub insert_time: DateTime<Utc>,
}

impl Trade {
    pub async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        maker: &Order,
        taker: &Order,
        quantity: Decimal,
        quote_quantity: Decimal,
        insert_time: DateTime<Utc>,
    ) -> Result<Trade, sqlx::Error> {
        sqlx::query_as::<_, Trade>(
            "INSERT INTO trades (id, symbol, maker_order_id, taker_order_id, price, quantity,
                                 quote_quantity, insert_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&maker.symbol)
        .bind(maker.id)
        .bind(taker.id)
        .bind(maker.price)
        .bind(quantity)
        .bind(quote_quantity)
        .bind(insert_time)
        .fetch_one(&mut **tx)
        .await
    }
}

/// One side of a trade: who paid which commission. Two per trade.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubTrade {
    pub id: Uuid,
    pub trade_id: Uuid,
    pub order_id: Uuid,
    pub account_id: Uuid,
    pub commission: Decimal,
    pub commission_asset: String,
    pub side: Side,
    pub is_maker: bool,
}

impl SubTrade {
    pub async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        trade: &Trade,
        order: &Order,
        commission: Decimal,
        commission_asset: &str,
        is_maker: bool,
    ) -> Result<SubTrade, sqlx::Error> {
        sqlx::query_as::<_, SubTrade>(
            "INSERT INTO subtrades (id, trade_id, order_id, account_id, commission,
                                    commission_asset, side, is_maker)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(trade.id)
        .bind(order.id)
        .bind(order.account_id)
        .bind(commission)
        .bind(commission_asset)
        .bind(order.side)
        .bind(is_maker)
        .fetch_one(&mut **tx)
        .await
    }
}
