/// Shared error type used across all sandbox-engine crates.
///
/// Variants map 1:1 onto the error kinds of the state-machine and
/// provider layers, not onto any one crate's internal failure modes —
/// see each variant's doc comment for who is expected to raise it.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("input validation: {0}")]
    InputValidation(String),

    #[error("provider {provider} does not support capability {capability}")]
    CapabilityUnsupported { provider: String, capability: String },

    #[error("illegal transition for {entity}: {from} -> {to} ({reason})")]
    IllegalTransition {
        entity: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("provider {provider} infra error: {message}")]
    ProviderInfra { provider: String, message: String },

    #[error("provider {provider} application error: {message}")]
    ProviderApplication { provider: String, message: String },

    #[error("lease {lease_id} is paused; explicit resume required")]
    LeasePaused { lease_id: String },

    #[error("schema inconsistency: {0}")]
    SchemaInconsistency(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQL: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// `true` for errors the runtime layer may retry exactly once
    ///.
    pub fn is_retryable_infra(&self) -> bool {
        matches!(self, Error::ProviderInfra { .. })
    }
}
