use thiserror::Error;
use uuid::Uuid;

/// Domain failures raised by the store. Service code carries these inside
/// `anyhow::Error`; the HTTP layer downcasts to choose a response.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("cart has no items")]
    EmptyCart,

    #[error("payment gateway error: {0}")]
    Gateway(String),

    #[error("invoice rendering failed: {0}")]
    Render(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("missing or invalid user identity")]
    Unauthorized,
}

impl StoreError {
    pub fn product_not_found(id: Uuid) -> Self {
        StoreError::NotFound { entity: "product", id }
    }
}
