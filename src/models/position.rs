use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::{Order, Side};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginType {
    Isolated,
    Cross,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionMode {
    OneWay,
    Hedge,
}

/// Isolated-margin position, one per (account, symbol) in one-way mode.
/// Only `MarginType::Isolated` and `PositionMode::OneWay` are implemented;
/// the other variants exist as wire values.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Position {
    pub id: Uuid,
    pub account_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub locked_quantity: Decimal,
    pub entry_price: Decimal,
    pub liquidation_price: Decimal,
    pub margin: Decimal,
    pub leverage: i32,
    pub margin_type: MarginType,
    pub position_mode: PositionMode,
}

impl Position {
    pub fn leverage_dec(&self) -> Decimal {
        Decimal::from(self.leverage)
    }

    /// Signed size: positive for LONG, negative for SHORT.
    pub fn size(&self) -> Decimal {
        match self.side {
            Side::Long => self.quantity,
            Side::Short => -self.quantity,
        }
    }

    pub async fn get(
        pool: &sqlx::PgPool,
        account_id: Uuid,
        symbol: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM positions WHERE account_id = $1 AND symbol = $2")
            .bind(account_id)
            .bind(symbol)
            .fetch_optional(pool)
            .await
    }

    /// Load the position an order settles against, creating a flat one on
    /// first fill. The row is exclusively locked either way.
    pub async fn for_order(
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
    ) -> Result<Self, sqlx::Error> {
        let existing = sqlx::query_as::<_, Self>(
            "SELECT * FROM positions WHERE account_id = $1 AND symbol = $2 FOR UPDATE",
        )
        .bind(order.account_id)
        .bind(&order.symbol)
        .fetch_optional(&mut **tx)
        .await?;
        if let Some(position) = existing {
            return Ok(position);
        }
        sqlx::query_as::<_, Self>(
            "INSERT INTO positions (account_id, symbol, side, leverage)
             VALUES ($1, $2, $3, $4)
             RETURNING *",
        )
        .bind(order.account_id)
        .bind(&order.symbol)
        .bind(order.side)
        .bind(order.leverage)
        .fetch_one(&mut **tx)
        .await
    }

    /// Lock quantity on the opposite-side position for a reduce-only order.
    /// Requires `quantity - locked_quantity >= amount > 0`.
    pub async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        symbol: &str,
        order_side: Side,
        amount: Decimal,
    ) -> Result<Self, EngineError> {
        let position = Self::select_for_update(tx, account_id, symbol, order_side.opposite()).await?;
        let Some(position) = position else {
            return Err(EngineError::InsufficientCollateral);
        };
        if !(amount > Decimal::ZERO && position.quantity - position.locked_quantity >= amount) {
            return Err(EngineError::InsufficientCollateral);
        }
        let updated = sqlx::query_as::<_, Self>(
            "UPDATE positions SET locked_quantity = locked_quantity + $1 WHERE id = $2 RETURNING *",
        )
        .bind(amount)
        .bind(position.id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(updated)
    }

    /// Release quantity locked by a reduce-only order (cancellation path).
    pub async fn unlock(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        symbol: &str,
        order_side: Side,
        amount: Decimal,
    ) -> Result<Self, EngineError> {
        let position = Self::select_for_update(tx, account_id, symbol, order_side.opposite())
            .await?
            .ok_or_else(|| {
                EngineError::InvariantViolation(format!(
                    "position unlock for account {account_id} on {symbol} with no position row"
                ))
            })?;
        if position.locked_quantity < amount {
            return Err(EngineError::InvariantViolation(format!(
                "position unlock of {amount} exceeds locked {} on {symbol}",
                position.locked_quantity
            )));
        }
        let updated = sqlx::query_as::<_, Self>(
            "UPDATE positions SET locked_quantity = locked_quantity - $1 WHERE id = $2 RETURNING *",
        )
        .bind(amount)
        .bind(position.id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(updated)
    }

    /// Recompute entry and liquidation prices from margin and quantity.
    /// A flat position carries all-zero marks.
    pub fn refresh_marks(&mut self) {
        if self.quantity.is_zero() {
            self.entry_price = Decimal::ZERO;
            self.liquidation_price = Decimal::ZERO;
            self.margin = Decimal::ZERO;
            return;
        }
        self.entry_price = self.margin * self.leverage_dec() / self.quantity;
        let step = self.entry_price / self.leverage_dec();
        self.liquidation_price = match self.side {
            Side::Long => self.entry_price - step,
            Side::Short => self.entry_price + step,
        };
    }

    pub async fn save(&self, tx: &mut Transaction<'_, Postgres>) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE positions SET
                side = $1,
                quantity = $2,
                locked_quantity = $3,
                entry_price = $4,
                liquidation_price = $5,
                margin = $6
             WHERE id = $7",
        )
        .bind(self.side)
        .bind(self.quantity)
        .bind(self.locked_quantity)
        .bind(self.entry_price)
        .bind(self.liquidation_price)
        .bind(self.margin)
        .bind(self.id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn select_for_update(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        symbol: &str,
        side: Side,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM positions
             WHERE account_id = $1 AND symbol = $2 AND side = $3
             FOR UPDATE",
        )
        .bind(account_id)
        .bind(symbol)
        .bind(side)
        .fetch_optional(&mut **tx)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(side: Side, quantity: Decimal, margin: Decimal, leverage: i32) -> Position {
        Position {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            side,
            quantity,
            locked_quantity: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            liquidation_price: Decimal::ZERO,
            margin,
            leverage,
            margin_type: MarginType::Isolated,
            position_mode: PositionMode::OneWay,
        }
    }

    #[test]
    fn marks_for_long() {
        let mut p = position(Side::Long, dec!(1), dec!(4000), 5);
        p.refresh_marks();
        assert_eq!(p.entry_price, dec!(20000));
        assert_eq!(p.liquidation_price, dec!(16000));
    }

    #[test]
    fn marks_for_short() {
        let mut p = position(Side::Short, dec!(3), dec!(72), 5);
        p.refresh_marks();
        assert_eq!(p.entry_price, dec!(120));
        assert_eq!(p.liquidation_price, dec!(144));
    }

    #[test]
    fn flat_position_zeroes_marks() {
        let mut p = position(Side::Long, Decimal::ZERO, Decimal::ZERO, 5);
        p.entry_price = dec!(100);
        p.liquidation_price = dec!(80);
        p.refresh_marks();
        assert_eq!(p.entry_price, Decimal::ZERO);
        assert_eq!(p.liquidation_price, Decimal::ZERO);
        assert_eq!(p.margin, Decimal::ZERO);
    }

    #[test]
    fn entry_times_quantity_equals_margin_times_leverage() {
        let mut p = position(Side::Long, dec!(0.4), dec!(1234.5), 10);
        p.refresh_marks();
        assert_eq!(p.entry_price * p.quantity, p.margin * p.leverage_dec());
    }

    #[test]
    fn signed_size() {
        assert_eq!(position(Side::Long, dec!(2), dec!(40), 5).size(), dec!(2));
        assert_eq!(position(Side::Short, dec!(2), dec!(40), 5).size(), dec!(-2));
    }
}
