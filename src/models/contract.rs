use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ContractStatus {
    Trading,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contract {
    pub id: Uuid,
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub base_precision: i32,
    pub quote_precision: i32,
    pub min_base_quantity: Decimal,
    pub min_quote_quantity: Decimal,
    pub status: ContractStatus,
}

impl Contract {
    pub async fn get_by_symbol(
        tx: &mut Transaction<'_, Postgres>,
        symbol: &str,
    ) -> Result<Option<Contract>, sqlx::Error> {
        sqlx::query_as::<_, Contract>("SELECT * FROM contracts WHERE symbol = $1")
            .bind(symbol)
            .fetch_optional(&mut **tx)
            .await
    }

    /// Floor a trade quantity to an integer multiple of the lot size.
    pub fn snap_quantity(&self, quantity: Decimal) -> Decimal {
        let lots = (quantity / self.min_base_quantity).trunc();
        lots * self.min_base_quantity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn contract(lot: Decimal) -> Contract {
        Contract {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            base_precision: 3,
            quote_precision: 2,
            min_base_quantity: lot,
            min_quote_quantity: dec!(10),
            status: ContractStatus::Trading,
        }
    }

    #[test]
    fn snap_keeps_exact_multiples() {
        let c = contract(dec!(0.001));
        assert_eq!(c.snap_quantity(dec!(1)), dec!(1));
        assert_eq!(c.snap_quantity(dec!(0.005)), dec!(0.005));
    }

    #[test]
    fn snap_floors_to_lot() {
        let c = contract(dec!(0.001));
        assert_eq!(c.snap_quantity(dec!(0.0015)), dec!(0.001));
        assert_eq!(c.snap_quantity(dec!(1.23456)), dec!(1.234));
    }

    #[test]
    fn snap_below_lot_is_zero() {
        let c = contract(dec!(0.01));
        assert_eq!(c.snap_quantity(dec!(0.005)), Decimal::ZERO);
    }
}
