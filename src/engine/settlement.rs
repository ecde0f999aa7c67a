//! Per-fill settlement: order fill counters, position arithmetic, the
//! balance exchange, and the trade/sub-trade records. Everything here runs
//! inside the event's transaction and commits or rolls back as one unit.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Postgres, Transaction};

use crate::config::{FeeSchedule, OrderRole};
use crate::error::EngineError;
use crate::events::EventBatch;
use crate::models::{
    Balance, Contract, LockedAsset, Order, OrderStatus, Position, Side, SubTrade, Trade,
    COLLATERAL_ASSET,
};

/// Settle one (maker, taker) pair. Returns the trade when a fill happened;
/// a quantity that snaps to zero terminates the taker without a trade.
pub async fn settle(
    tx: &mut Transaction<'_, Postgres>,
    maker: &mut Order,
    taker: &mut Order,
    contract: &Contract,
    fees: &FeeSchedule,
    insert_time: DateTime<Utc>,
    batch: &mut EventBatch,
) -> Result<Option<Trade>, EngineError> {
    let maker_remaining = maker.remaining_quantity();
    let raw_quantity = if taker.is_quote_measured() {
        let remaining_quote = taker.remaining_quote();
        if maker_remaining * maker.price <= remaining_quote {
            maker_remaining
        } else {
            remaining_quote / maker.price
        }
    } else {
        maker_remaining.min(taker.remaining_quantity())
    };

    let quantity = contract.snap_quantity(raw_quantity);
    if quantity.is_zero() {
        // Un-snappable remainder: a taker that already filled something dies
        // FILLED, one that never filled dies CANCELED. No trade is written.
        taker.status = if taker.filled_quantity > Decimal::ZERO {
            OrderStatus::Filled
        } else {
            OrderStatus::Canceled
        };
        return Ok(None);
    }
    let quote_quantity = quantity * maker.price;

    if quantity == maker_remaining {
        maker.status = OrderStatus::Filled;
    }
    let taker_done = if taker.is_quote_measured() {
        taker.remaining_quote() == quote_quantity
    } else {
        taker.remaining_quantity() == quantity
    };
    if taker_done {
        taker.status = OrderStatus::Filled;
    }

    let trade = Trade::insert(tx, maker, taker, quantity, quote_quantity, insert_time).await?;

    apply_side(tx, maker, &trade, OrderRole::Maker, fees, batch).await?;
    apply_side(tx, taker, &trade, OrderRole::Taker, fees, batch).await?;

    maker.save(tx).await?;

    batch.trades.push(trade.clone());
    Ok(Some(trade))
}

/// Apply one side of a trade to its order, position and balance.
///
/// Row locks are taken in the fixed order Order -> Balance -> Position; the
/// order rows were locked by the caller. Each side persists its position and
/// balance before the other side runs, so a self-match reads its own writes.
async fn apply_side(
    tx: &mut Transaction<'_, Postgres>,
    order: &mut Order,
    trade: &Trade,
    role: OrderRole,
    fees: &FeeSchedule,
    batch: &mut EventBatch,
) -> Result<(), EngineError> {
    order.filled_quantity += trade.quantity;
    order.filled_quote += trade.quote_quantity;

    let is_maker = role == OrderRole::Maker;
    let mut commission = trade.quote_quantity * fees.rate(role);
    let mut rebate = Decimal::ZERO;
    if commission < Decimal::ZERO {
        rebate = -commission;
        commission = Decimal::ZERO;
    }

    let balance = Balance::lock_row(tx, order.account_id).await?;
    let mut position = Position::for_order(tx, order).await?;

    let leverage = order.leverage_dec();
    // Realized pnl plus released margin, net of commission.
    let mut margin_to_free = Decimal::ZERO;
    // Part of the order's lock returned to free when a reduce closes value.
    let mut closed_to_free = Decimal::ZERO;
    // What this fill consumes from the order's lock.
    let mut lock_draw = Decimal::ZERO;

    if position.side == order.side {
        // Open or increase the position.
        if order.locked_asset == LockedAsset::Position {
            return Err(EngineError::InvariantViolation(format!(
                "position-locked order {} would increase the position",
                order.id
            )));
        }
        position.quantity += trade.quantity;
        let margin_delta = trade.quote_quantity / leverage;
        position.margin += margin_delta;
        lock_draw = margin_delta + commission;
    } else {
        // Reduce the position, flipping it when the fill is larger.
        let closed = position.quantity.min(trade.quantity);
        position.quantity -= closed;
        let released_margin = closed * position.entry_price / leverage;
        let closed_quote = closed * trade.price / leverage;
        let mut pnl = (closed_quote - released_margin) * position.leverage_dec();
        if position.side == Side::Short {
            pnl = -pnl;
        }
        margin_to_free = pnl + released_margin - commission;
        position.margin -= released_margin;

        let reopened = trade.quantity - closed;
        if reopened > Decimal::ZERO {
            position.side = order.side;
            position.quantity = reopened;
            position.margin += reopened * trade.price / leverage;
        }

        match order.locked_asset {
            LockedAsset::Asset => {
                closed_to_free = closed_quote;
                lock_draw = trade.quote_quantity / leverage;
            }
            LockedAsset::Position => {
                position.locked_quantity -= trade.quantity;
                order.locked_quantity -= trade.quantity;
            }
        }
    }
    position.refresh_marks();

    // Draw the fill's collateral from the order's lock; whatever the lock
    // cannot cover (a market order locks its zero quote value) is paid from
    // free. A filled order returns its whole residual lock.
    let mut from_lock = Decimal::ZERO;
    let mut from_free = Decimal::ZERO;
    let mut residual = Decimal::ZERO;
    if order.locked_asset == LockedAsset::Asset {
        from_lock = lock_draw.min(order.locked_quantity);
        from_free = lock_draw - from_lock;
        order.locked_quantity -= from_lock;
        if order.status == OrderStatus::Filled {
            residual = order.locked_quantity;
            order.locked_quantity = Decimal::ZERO;
        }
    }

    let unlocked = from_lock + residual;
    let free_delta = margin_to_free + closed_to_free + residual - from_free;
    let updated = balance.exchange(tx, unlocked, free_delta, rebate).await?;

    position.save(tx).await?;
    let sub_trade = SubTrade::insert(tx, trade, order, commission, COLLATERAL_ASSET, is_maker).await?;

    batch.push_balance(updated);
    batch.push_position(position);
    batch.sub_trades.push(sub_trade);
    Ok(())
}
