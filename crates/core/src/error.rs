#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Claim conflict: {0}")]
    ClaimConflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
