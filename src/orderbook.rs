//! Read side of the book: maker candidates for matching and level
//! aggregation for order-book delta events. Resting orders live in the
//! orders table; there is no in-memory book.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{Order, OrderType, Side};

/// Makers are consumed in batches of up to this many rows.
pub const MAKER_PAGE_SIZE: i64 = 10;

/// Fetch the next batch of maker candidates for a taker, best price first,
/// oldest first within a price, exclusively locked.
///
/// Settled makers leave the PLACED set, so the batch always starts at the
/// current front of the book; the match loop terminates when a batch comes
/// back empty or the taker goes terminal.
pub async fn maker_page(
    tx: &mut Transaction<'_, Postgres>,
    taker: &Order,
) -> Result<Vec<Order>, sqlx::Error> {
    let (price_order, cross) = match taker.side {
        Side::Long => ("ASC", "price <= $3"),
        Side::Short => ("DESC", "price >= $3"),
    };
    let price_filter = match taker.order_type {
        OrderType::Limit => format!("AND {cross}"),
        OrderType::Market => String::new(),
    };
    let sql = format!(
        "SELECT * FROM orders
         WHERE status = 'PLACED' AND symbol = $1 AND side = $2 {price_filter}
         ORDER BY price {price_order}, insert_time ASC
         LIMIT {MAKER_PAGE_SIZE}
         FOR UPDATE"
    );
    let mut query = sqlx::query_as::<_, Order>(&sql)
        .bind(&taker.symbol)
        .bind(taker.side.opposite());
    if taker.order_type == OrderType::Limit {
        query = query.bind(taker.price);
    }
    query.fetch_all(&mut **tx).await
}

/// One (side, price) level of the book with its summed open quantity.
/// Zero quantity marks a removed level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BookLevel {
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Aggregate open quantity per (side, price) over the given levels.
/// Levels with no resting quantity are simply absent from the result.
pub async fn aggregate(
    pool: &PgPool,
    symbol: &str,
    levels: &[(Side, Decimal)],
) -> Result<Vec<BookLevel>, sqlx::Error> {
    if levels.is_empty() {
        return Ok(Vec::new());
    }
    let sides: Vec<String> = levels.iter().map(|(side, _)| side.to_string()).collect();
    let prices: Vec<Decimal> = levels.iter().map(|(_, price)| *price).collect();
    let rows = sqlx::query_as::<_, BookLevel>(
        "SELECT side, price, SUM(quantity - filled_quantity) AS quantity
         FROM orders
         WHERE status = 'PLACED' AND symbol = $1 AND side = ANY($2) AND price = ANY($3)
         GROUP BY price, side
         ORDER BY price DESC, side DESC",
    )
    .bind(symbol)
    .bind(&sides)
    .bind(&prices)
    .fetch_all(pool)
    .await?;
    // The array filters are per-column; keep only the requested pairs.
    Ok(rows
        .into_iter()
        .filter(|row| levels.iter().any(|(s, p)| *s == row.side && *p == row.price))
        .collect())
}
