use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::EngineError;

/// The single collateral asset used by the matching core.
pub const COLLATERAL_ASSET: &str = "USDT";

/// Fractional digits a lock amount is ceil-rounded to, once, at the lock
/// boundary. Settlement subtracts exact amounts from the stored lock and
/// releases the whole residual when the order fills, so the lock always ends
/// at zero.
const LOCK_SCALE: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Balance {
    pub id: Uuid,
    pub account_id: Uuid,
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    /// Round a lock amount up to [`LOCK_SCALE`] fractional digits.
    pub fn lock_amount(amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(LOCK_SCALE, RoundingStrategy::ToPositiveInfinity)
    }

    pub async fn get(pool: &PgPool, account_id: Uuid, asset: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM balances WHERE account_id = $1 AND asset = $2")
            .bind(account_id)
            .bind(asset)
            .fetch_optional(pool)
            .await
    }

    /// Credit an amount to the free balance, creating the row lazily on the
    /// first credit. Used by the deposit path and by rebates outside fills.
    pub async fn credit(
        pool: &PgPool,
        account_id: Uuid,
        asset: &str,
        amount: Decimal,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO balances (account_id, asset, free)
             VALUES ($1, $2, $3)
             ON CONFLICT (account_id, asset) DO UPDATE SET
                free = balances.free + $3,
                updated_at = NOW()
             RETURNING *",
        )
        .bind(account_id)
        .bind(asset)
        .bind(amount)
        .fetch_one(pool)
        .await
    }

    /// Move `amount` from free to locked for the collateral asset.
    /// Fails with `InsufficientCollateral` when the row is absent or
    /// under-funded; nothing is partially locked.
    pub async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<Self, EngineError> {
        let balance = Self::select_for_update(tx, account_id).await?;
        let Some(balance) = balance else {
            return Err(EngineError::InsufficientCollateral);
        };
        if balance.free < amount {
            return Err(EngineError::InsufficientCollateral);
        }
        let updated = sqlx::query_as::<_, Self>(
            "UPDATE balances SET free = free - $1, locked = locked + $1, updated_at = NOW()
             WHERE id = $2 RETURNING *",
        )
        .bind(amount)
        .bind(balance.id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(updated)
    }

    /// Move `amount` from locked back to free. Used by cancellation.
    pub async fn unlock(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<Self, EngineError> {
        let balance = Self::select_for_update(tx, account_id)
            .await?
            .ok_or(EngineError::InvariantViolation(format!(
                "unlock of {amount} {COLLATERAL_ASSET} for account {account_id} with no balance row"
            )))?;
        if balance.locked < amount {
            return Err(EngineError::InvariantViolation(format!(
                "unlock of {amount} exceeds locked {} for account {account_id}",
                balance.locked
            )));
        }
        let updated = sqlx::query_as::<_, Self>(
            "UPDATE balances SET free = free + $1, locked = locked - $1, updated_at = NOW()
             WHERE id = $2 RETURNING *",
        )
        .bind(amount)
        .bind(balance.id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(updated)
    }

    /// Acquire the row lock on the account's collateral balance, creating a
    /// zero row when the account has never held the asset (a reduce-only
    /// order can settle proceeds into an account with no prior deposit).
    pub async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
    ) -> Result<Self, EngineError> {
        if let Some(balance) = Self::select_for_update(tx, account_id).await? {
            return Ok(balance);
        }
        let created = sqlx::query_as::<_, Self>(
            "INSERT INTO balances (account_id, asset) VALUES ($1, $2) RETURNING *",
        )
        .bind(account_id)
        .bind(COLLATERAL_ASSET)
        .fetch_one(&mut **tx)
        .await?;
        Ok(created)
    }

    /// The per-fill balance exchange: `locked -= unlocked` and
    /// `free += free_delta + rebate`, atomically on the already-locked row.
    /// A result that would drive either column negative is an invariant
    /// violation and aborts the event.
    pub async fn exchange(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        unlocked: Decimal,
        free_delta: Decimal,
        rebate: Decimal,
    ) -> Result<Self, EngineError> {
        let new_locked = self.locked - unlocked;
        let new_free = self.free + free_delta + rebate;
        if new_locked < Decimal::ZERO {
            return Err(EngineError::InvariantViolation(format!(
                "balance exchange would leave locked at {new_locked} for account {}",
                self.account_id
            )));
        }
        if new_free < Decimal::ZERO {
            return Err(EngineError::InvariantViolation(format!(
                "balance exchange would leave free at {new_free} for account {}",
                self.account_id
            )));
        }
        let updated = sqlx::query_as::<_, Self>(
            "UPDATE balances SET free = $1, locked = $2, updated_at = NOW()
             WHERE id = $3 RETURNING *",
        )
        .bind(new_free)
        .bind(new_locked)
        .bind(self.id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(updated)
    }

    async fn select_for_update(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM balances WHERE account_id = $1 AND asset = $2 FOR UPDATE",
        )
        .bind(account_id)
        .bind(COLLATERAL_ASSET)
        .fetch_optional(&mut **tx)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn lock_amount_rounds_up_to_three_digits() {
        assert_eq!(Balance::lock_amount(dec!(4060)), dec!(4060));
        assert_eq!(Balance::lock_amount(dec!(0.0001)), dec!(0.001));
        assert_eq!(Balance::lock_amount(dec!(81.2)), dec!(81.2));
        assert_eq!(Balance::lock_amount(dec!(12.34567)), dec!(12.346));
    }

    #[test]
    fn lock_amount_never_rounds_down() {
        let exact = dec!(19.999000000000001);
        assert!(Balance::lock_amount(exact) >= exact);
    }
}
