//! Error taxonomy shared by every component of the engine
use super::request::RequestStatus;
use super::types::Money;
use sled::transaction::{ConflictableTransactionError, TransactionError};

pub type OrderResult<T> = Result<T, OrderError>;

/// Result type used inside sled transaction closures.
pub(crate) type TxResult<T> = Result<T, ConflictableTransactionError<OrderError>>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    #[error("cannot move request from {current:?} to {requested:?}")]
    InvalidTransition {
        current: RequestStatus,
        requested: RequestStatus,
    },
    #[error("request is {0:?}; only pending requests can be deleted")]
    NotDeletable(RequestStatus),
    #[error("unknown transition '{0}'")]
    UnknownTransition(String),
    #[error("insufficient budget: requested {requested}, available {available}")]
    InsufficientBudget { requested: Money, available: Money },
    #[error("insufficient stock for product {product_id}: in stock {in_stock}, delta {delta}")]
    InsufficientStock {
        product_id: u64,
        in_stock: u64,
        delta: i64,
    },
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Money),
    #[error("a non-empty reason is required to move a request to {0:?}")]
    MissingReason(RequestStatus),
    #[error("a non-empty actor is required")]
    MissingActor,
    #[error("requested quantity must be between 1 and {}", i64::MAX)]
    InvalidQuantity,
    #[error("monetary amount out of range")]
    AmountOverflow,
    #[error("request '{0}' not found")]
    RequestNotFound(String),
    #[error("no price registered for product {0}")]
    UnknownProduct(u64),
    #[error("request '{0}' was modified concurrently, reload and retry")]
    ConcurrentModification(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("remote call timed out after {0} ms")]
    RemoteTimeout(u64),
}

impl OrderError {
    /// Whether a caller may retry the same call from a fresh read.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrderError::ConcurrentModification(_)
                | OrderError::StorageFailure(_)
                | OrderError::RemoteTimeout(_)
        )
    }
}

impl From<sled::Error> for OrderError {
    fn from(value: sled::Error) -> Self {
        OrderError::StorageFailure(value.to_string())
    }
}

impl From<minicbor::decode::Error> for OrderError {
    fn from(value: minicbor::decode::Error) -> Self {
        OrderError::StorageFailure(format!("decode: {value}"))
    }
}

impl From<minicbor::encode::Error<std::convert::Infallible>> for OrderError {
    fn from(value: minicbor::encode::Error<std::convert::Infallible>) -> Self {
        OrderError::StorageFailure(format!("encode: {value}"))
    }
}

impl From<TransactionError<OrderError>> for OrderError {
    fn from(value: TransactionError<OrderError>) -> Self {
        match value {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => e.into(),
        }
    }
}

/// Lifts a domain result into a transaction closure, aborting the unit of work on error.
pub(crate) trait AbortOnErr<T> {
    fn or_abort(self) -> TxResult<T>;
}

impl<T, E: Into<OrderError>> AbortOnErr<T> for Result<T, E> {
    fn or_abort(self) -> TxResult<T> {
        self.map_err(|e| ConflictableTransactionError::Abort(e.into()))
    }
}

pub(crate) fn abort<T>(error: OrderError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(error))
}
