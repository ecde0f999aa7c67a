//! The order-lifecycle state machine. One inbound order-update event is
//! processed at a time per symbol: the engine locks the order row,
//! dispatches to matching or cancellation, settles fills, and commits the
//! whole event atomically.

pub mod settlement;

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::FeeSchedule;
use crate::error::EngineError;
use crate::events::{EventBatch, OrderEvent};
use crate::models::{Balance, Contract, LockedAsset, Order, OrderStatus, OrderType, Position};
use crate::orderbook::{self, BookLevel};

/// Bounded row-lock wait; expiry maps to `EngineError::Conflict` and the
/// event is re-queued.
const LOCK_TIMEOUT_SQL: &str = "SET LOCAL lock_timeout = '5s'";

pub struct Engine {
    pool: PgPool,
    fees: FeeSchedule,
    clock: Clock,
    /// Last trade insert_time per symbol, to keep the sequence strictly
    /// monotone even within a single multi-fill event.
    last_trade_time: HashMap<String, DateTime<Utc>>,
}

impl Engine {
    pub fn new(pool: PgPool, fees: FeeSchedule, clock: Clock) -> Self {
        Self {
            pool,
            fees,
            clock,
            last_trade_time: HashMap::new(),
        }
    }

    /// Process one inbound order-update event and return the records to
    /// publish. A snapshot status of QUEUED means send; anything else
    /// (including a missing status) means cancel.
    pub async fn handle_order_event(&mut self, event: &OrderEvent) -> Result<EventBatch, EngineError> {
        let mut tx = self.begin().await?;
        let mut order = Order::get_for_update(&mut tx, event.id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("order {}", event.id)))?;
        let mut batch = EventBatch::new(&order.symbol);

        if event.status == Some(OrderStatus::Queued) {
            if order.status != OrderStatus::Queued {
                // Replay of an already-processed send event; emit the current
                // snapshot and nothing else.
                debug!(order_id = %order.id, status = %order.status, "ignoring replayed send");
                tx.rollback().await?;
            } else {
                let contract = Contract::get_by_symbol(&mut tx, &order.symbol)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("contract {}", order.symbol)))?;
                self.match_order(&mut tx, &mut order, &contract, &mut batch).await?;
                if matches!(order.status, OrderStatus::Placed | OrderStatus::Filled) {
                    order.save(&mut tx).await?;
                    tx.commit().await?;
                    info!(
                        order_id = %order.id,
                        status = %order.status,
                        fills = batch.trades.len(),
                        "matched order"
                    );
                } else {
                    // Nothing matched and the order cannot rest: drop the
                    // tentative work and release the lock instead.
                    tx.rollback().await?;
                    batch = EventBatch::new(&order.symbol);
                    order = self.cancel_by_id(event.id, &mut batch).await?;
                }
            }
        } else {
            self.cancel_locked(&mut tx, &mut order, &mut batch).await?;
            tx.commit().await?;
        }

        batch.orders.push(order.clone());
        self.attach_book_levels(&order, &mut batch).await?;
        Ok(batch)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, EngineError> {
        let mut tx = self.pool.begin().await?;
        sqlx::raw_sql(LOCK_TIMEOUT_SQL).execute(&mut *tx).await?;
        Ok(tx)
    }

    /// Cancel in a fresh transaction, re-reading the order under lock.
    async fn cancel_by_id(&self, order_id: Uuid, batch: &mut EventBatch) -> Result<Order, EngineError> {
        let mut tx = self.begin().await?;
        let mut order = Order::get_for_update(&mut tx, order_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("order {order_id}")))?;
        self.cancel_locked(&mut tx, &mut order, batch).await?;
        tx.commit().await?;
        Ok(order)
    }

    /// Release the order's collateral and mark it CANCELED. Terminal orders
    /// are left untouched, which makes a late cancel a no-op.
    async fn cancel_locked(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order: &mut Order,
        batch: &mut EventBatch,
    ) -> Result<(), EngineError> {
        if !order.status.is_open() {
            debug!(order_id = %order.id, status = %order.status, "cancel of terminal order ignored");
            return Ok(());
        }
        match order.locked_asset {
            LockedAsset::Asset => {
                let balance = Balance::unlock(tx, order.account_id, order.locked_quantity).await?;
                batch.push_balance(balance);
            }
            LockedAsset::Position => {
                let position = Position::unlock(
                    tx,
                    order.account_id,
                    &order.symbol,
                    order.side,
                    order.locked_quantity,
                )
                .await?;
                batch.push_position(position);
            }
        }
        order.status = OrderStatus::Canceled;
        order.locked_quantity = Decimal::ZERO;
        order.save(tx).await?;
        info!(order_id = %order.id, "canceled order");
        Ok(())
    }

    /// Consume maker batches until the taker is terminal or the book side is
    /// exhausted. Settled makers leave the PLACED set, so every batch starts
    /// at the current front of the book; each settlement either fills its
    /// maker or terminates the taker, which bounds the loop.
    async fn match_order(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
        taker: &mut Order,
        contract: &Contract,
        batch: &mut EventBatch,
    ) -> Result<(), EngineError> {
        if taker.post_only {
            taker.status = OrderStatus::Placed;
            return Ok(());
        }
        'book: loop {
            let makers = orderbook::maker_page(tx, taker).await?;
            if makers.is_empty() {
                break;
            }
            for mut maker in makers {
                let insert_time = self.next_trade_time(tx, &taker.symbol).await?;
                let trade = settlement::settle(
                    tx,
                    &mut maker,
                    taker,
                    contract,
                    &self.fees,
                    insert_time,
                    batch,
                )
                .await?;
                if trade.is_some() {
                    batch.orders.push(maker);
                }
                if taker.status.is_terminal() {
                    break 'book;
                }
            }
        }
        if taker.order_type == OrderType::Limit && taker.status == OrderStatus::Queued {
            taker.status = OrderStatus::Placed;
        }
        Ok(())
    }

    /// Strictly-monotone trade timestamp for a symbol. Seeded from the
    /// trades table on first use so monotonicity survives restarts.
    async fn next_trade_time(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
        symbol: &str,
    ) -> Result<DateTime<Utc>, EngineError> {
        if !self.last_trade_time.contains_key(symbol) {
            let persisted: Option<DateTime<Utc>> =
                sqlx::query_scalar("SELECT MAX(insert_time) FROM trades WHERE symbol = $1")
                    .bind(symbol)
                    .fetch_one(&mut **tx)
                    .await?;
            if let Some(last) = persisted {
                self.last_trade_time.insert(symbol.to_string(), last);
            }
        }
        let mut next = self.clock.now();
        if let Some(last) = self.last_trade_time.get(symbol) {
            if next <= *last {
                next = *last + Duration::microseconds(1);
            }
        }
        self.last_trade_time.insert(symbol.to_string(), next);
        Ok(next)
    }

    /// Re-aggregate the touched price levels after commit; levels with no
    /// remaining quantity become zero tombstones.
    async fn attach_book_levels(
        &self,
        inbound: &Order,
        batch: &mut EventBatch,
    ) -> Result<(), EngineError> {
        let levels = batch.affected_levels(inbound);
        if levels.is_empty() {
            return Ok(());
        }
        let mut found = orderbook::aggregate(&self.pool, &batch.symbol, &levels).await?;
        for (side, price) in levels {
            if !found.iter().any(|level| level.side == side && level.price == price) {
                found.push(BookLevel {
                    side,
                    price,
                    quantity: Decimal::ZERO,
                });
            }
        }
        batch.book_levels = found;
        Ok(())
    }
}
