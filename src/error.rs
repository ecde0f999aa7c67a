/// Errors on the matching path. Validation errors on the submission path use
/// [`crate::models::OrderError`] instead; these never surface to users.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A referenced row does not exist; the event is discarded with a warning.
    #[error("not found: {0}")]
    NotFound(String),
    /// A row-lock wait timed out; the event is rolled back and re-queued.
    #[error("row lock conflict")]
    Conflict,
    /// Pre-trade collateral lock failed; nothing was mutated.
    #[error("insufficient collateral")]
    InsufficientCollateral,
    /// An arithmetic invariant would be breached. The transaction aborts and
    /// the symbol halts until an operator intervenes.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("publish error: {0}")]
    Publish(String),
}

impl EngineError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Conflict)
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        // 55P03 is lock_not_available: the bounded lock wait expired.
        if let sqlx::Error::Database(ref db) = err {
            if db.code().as_deref() == Some("55P03") {
                return EngineError::Conflict;
            }
        }
        EngineError::Database(err)
    }
}
