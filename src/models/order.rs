use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{Account, Balance, Contract, ContractStatus, Position};
use crate::config::{FeeSchedule, OrderRole};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Queued,
    Placed,
    Filled,
    Canceled,
}

impl OrderStatus {
    /// QUEUED and PLACED orders hold collateral and can still be canceled.
    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::Queued | OrderStatus::Placed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Queued => write!(f, "QUEUED"),
            OrderStatus::Placed => write!(f, "PLACED"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// What an order's lock is held against: quote collateral for opening
/// orders, position quantity for reduce-only orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum LockedAsset {
    Asset,
    Position,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    pub account_id: Uuid,
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: Decimal,
    pub quantity: Decimal,
    pub quote_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub filled_quote: Decimal,
    pub leverage: i32,
    pub post_only: bool,
    pub reduce_only: bool,
    pub locked_asset: LockedAsset,
    pub locked_quantity: Decimal,
    pub insert_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub account_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub post_only: bool,
    pub reduce_only: bool,
    /// Limit price; zero for market orders.
    pub price: Decimal,
    /// Base quantity; zero for market buys, which measure in quote.
    pub quantity: Decimal,
    /// Quote value; only market buys carry it.
    pub quote_quantity: Decimal,
}

#[derive(Debug)]
pub struct PlaceOrderResult {
    pub order: Order,
    pub locked_asset: LockedAsset,
    pub locked_amount: Decimal,
}

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("insufficient collateral: required {required}")]
    InsufficientCollateral { required: Decimal },
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("symbol is not trading: {0}")]
    NotTrading(String),
    #[error("unknown account: {0}")]
    UnknownAccount(Uuid),
    #[error("invalid order: {0}")]
    Invalid(&'static str),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Order {
    /// Remaining base quantity for base-measured orders.
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    /// Remaining quote value for quote-measured orders (market buys).
    pub fn remaining_quote(&self) -> Decimal {
        self.quote_quantity - self.filled_quote
    }

    /// Market buys carry no base quantity and fill against their quote value.
    pub fn is_quote_measured(&self) -> bool {
        self.quantity.is_zero()
    }

    pub fn leverage_dec(&self) -> Decimal {
        Decimal::from(self.leverage)
    }

    /// Validate a submission against the contract, mirroring what the public
    /// API enforces before an order is accepted.
    pub fn validate(req: &OrderRequest, contract: &Contract) -> Result<(), OrderError> {
        match req.order_type {
            OrderType::Limit => {
                if req.price <= Decimal::ZERO || req.quantity <= Decimal::ZERO {
                    return Err(OrderError::Invalid("limit order requires price and quantity"));
                }
                if !req.quote_quantity.is_zero() {
                    return Err(OrderError::Invalid("limit order cannot carry quote_quantity"));
                }
                if req.quantity < contract.min_base_quantity {
                    return Err(OrderError::Invalid("quantity below min_base_quantity"));
                }
                if req.quantity * req.price < contract.min_quote_quantity {
                    return Err(OrderError::Invalid("order value below min_quote_quantity"));
                }
                if req.quantity.scale() > contract.base_precision as u32 {
                    return Err(OrderError::Invalid("quantity precision exceeds base_precision"));
                }
                if req.price.scale() > contract.quote_precision as u32 {
                    return Err(OrderError::Invalid("price precision exceeds quote_precision"));
                }
            }
            OrderType::Market => {
                if req.post_only {
                    return Err(OrderError::Invalid("market order cannot be post-only"));
                }
                if !req.price.is_zero() {
                    return Err(OrderError::Invalid("market order cannot carry a price"));
                }
                match req.side {
                    Side::Long => {
                        if !req.quantity.is_zero() {
                            return Err(OrderError::Invalid("market buy measures in quote_quantity"));
                        }
                        if req.quote_quantity < contract.min_quote_quantity {
                            return Err(OrderError::Invalid("quote_quantity below min_quote_quantity"));
                        }
                        if req.quote_quantity.scale() > contract.quote_precision as u32 {
                            return Err(OrderError::Invalid(
                                "quote_quantity precision exceeds quote_precision",
                            ));
                        }
                    }
                    Side::Short => {
                        if !req.quote_quantity.is_zero() {
                            return Err(OrderError::Invalid("market sell measures in quantity"));
                        }
                        if req.quantity < contract.min_base_quantity {
                            return Err(OrderError::Invalid("quantity below min_base_quantity"));
                        }
                        if req.quantity.scale() > contract.base_precision as u32 {
                            return Err(OrderError::Invalid("quantity precision exceeds base_precision"));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Accept an order: validate, lock collateral, insert as QUEUED.
    /// The caller emits the send-order event after this returns.
    pub async fn place(
        pool: &PgPool,
        fees: &FeeSchedule,
        req: OrderRequest,
    ) -> Result<PlaceOrderResult, OrderError> {
        let mut tx = pool.begin().await?;

        let contract = Contract::get_by_symbol(&mut tx, &req.symbol)
            .await?
            .ok_or_else(|| OrderError::UnknownSymbol(req.symbol.clone()))?;
        if contract.status != ContractStatus::Trading {
            return Err(OrderError::NotTrading(req.symbol.clone()));
        }
        Self::validate(&req, &contract)?;

        let account = Account::get(pool, req.account_id)
            .await?
            .ok_or(OrderError::UnknownAccount(req.account_id))?;

        let order_id = Uuid::new_v4();
        let (locked_asset, locked_amount) = if req.reduce_only {
            let amount = req.quantity;
            Position::lock(&mut tx, req.account_id, &req.symbol, req.side, amount)
                .await
                .map_err(|e| lock_error(e, amount))?;
            (LockedAsset::Position, amount)
        } else {
            let order_value = match req.order_type {
                OrderType::Limit => req.quantity * req.price,
                OrderType::Market => req.quote_quantity,
            };
            let mut amount = order_value / Decimal::from(account.leverage);
            if !req.post_only {
                amount += order_value * fees.rate(OrderRole::Taker);
            }
            // One rounding, at the lock boundary; settlement releases the
            // stored amount exactly.
            let amount = Balance::lock_amount(amount);
            Balance::lock(&mut tx, req.account_id, amount)
                .await
                .map_err(|e| lock_error(e, amount))?;
            (LockedAsset::Asset, amount)
        };

        let order = sqlx::query_as::<_, Order>(
            "INSERT INTO orders (id, account_id, symbol, base, quote, side, order_type, price,
                                 quantity, quote_quantity, leverage, post_only, reduce_only,
                                 locked_asset, locked_quantity)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
             RETURNING *",
        )
        .bind(order_id)
        .bind(req.account_id)
        .bind(&req.symbol)
        .bind(&contract.base_asset)
        .bind(&contract.quote_asset)
        .bind(req.side)
        .bind(req.order_type)
        .bind(req.price)
        .bind(req.quantity)
        .bind(req.quote_quantity)
        .bind(account.leverage)
        .bind(req.post_only)
        .bind(req.reduce_only)
        .bind(locked_asset)
        .bind(locked_amount)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PlaceOrderResult {
            order,
            locked_asset,
            locked_amount,
        })
    }

    /// Load and exclusively lock an order row.
    pub async fn get_for_update(
        tx: &mut Transaction<'_, Postgres>,
        order_id: Uuid,
    ) -> Result<Option<Order>, sqlx::Error> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
            .fetch_optional(&mut **tx)
            .await
    }

    pub async fn get(pool: &PgPool, order_id: Uuid) -> Result<Option<Order>, sqlx::Error> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(pool)
            .await
    }

    /// Persist the mutable columns of a locked order.
    pub async fn save(&self, tx: &mut Transaction<'_, Postgres>) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE orders SET
                status = $1,
                filled_quantity = $2,
                filled_quote = $3,
                locked_quantity = $4,
                update_time = NOW()
             WHERE id = $5",
        )
        .bind(self.status)
        .bind(self.filled_quantity)
        .bind(self.filled_quote)
        .bind(self.locked_quantity)
        .bind(self.id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn lock_error(err: EngineError, required: Decimal) -> OrderError {
    match err {
        EngineError::InsufficientCollateral => OrderError::InsufficientCollateral { required },
        EngineError::Database(e) => OrderError::Database(e),
        _ => OrderError::Invalid("collateral lock failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn contract() -> Contract {
        Contract {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            base_precision: 3,
            quote_precision: 2,
            min_base_quantity: dec!(0.001),
            min_quote_quantity: dec!(10),
            status: ContractStatus::Trading,
        }
    }

    fn limit_request(price: Decimal, quantity: Decimal) -> OrderRequest {
        OrderRequest {
            account_id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            order_type: OrderType::Limit,
            post_only: false,
            reduce_only: false,
            price,
            quantity,
            quote_quantity: Decimal::ZERO,
        }
    }

    #[test]
    fn accepts_valid_limit() {
        assert!(Order::validate(&limit_request(dec!(20000), dec!(1)), &contract()).is_ok());
    }

    #[test]
    fn rejects_limit_without_price() {
        let req = limit_request(Decimal::ZERO, dec!(1));
        assert!(Order::validate(&req, &contract()).is_err());
    }

    #[test]
    fn rejects_dust_quantity() {
        let req = limit_request(dec!(20000), dec!(0.0001));
        assert!(Order::validate(&req, &contract()).is_err());
    }

    #[test]
    fn rejects_excess_price_precision() {
        let req = limit_request(dec!(20000.123), dec!(1));
        assert!(Order::validate(&req, &contract()).is_err());
    }

    #[test]
    fn rejects_post_only_market() {
        let req = OrderRequest {
            order_type: OrderType::Market,
            post_only: true,
            price: Decimal::ZERO,
            quantity: Decimal::ZERO,
            quote_quantity: dec!(100),
            ..limit_request(Decimal::ZERO, Decimal::ZERO)
        };
        assert!(Order::validate(&req, &contract()).is_err());
    }

    #[test]
    fn market_buy_measures_in_quote() {
        let mut req = limit_request(Decimal::ZERO, Decimal::ZERO);
        req.order_type = OrderType::Market;
        req.quote_quantity = dec!(100);
        assert!(Order::validate(&req, &contract()).is_ok());

        req.quantity = dec!(1);
        assert!(Order::validate(&req, &contract()).is_err());
    }

    #[test]
    fn market_sell_measures_in_base() {
        let mut req = limit_request(Decimal::ZERO, dec!(1));
        req.order_type = OrderType::Market;
        req.side = Side::Short;
        assert!(Order::validate(&req, &contract()).is_ok());

        req.quote_quantity = dec!(100);
        assert!(Order::validate(&req, &contract()).is_err());
    }
}
