//! Error types for Cadence

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CadenceError>;

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Scheduling error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CadenceError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CadenceError::InvalidInput(_) => 3,
            CadenceError::Config(_) => 2,
            CadenceError::Credential(_) => 2,
            CadenceError::Database(_) => 1,
            CadenceError::Schedule(_) => 1,
            CadenceError::Publish(_) => 1,
        }
    }

    /// Whether the job runner should retry the whole item after this error.
    ///
    /// Only server/transport failures and transient credential failures are
    /// retried; a locked or busy database is treated the same way.
    pub fn is_retryable(&self) -> bool {
        match self {
            CadenceError::Publish(e) => e.is_retryable(),
            CadenceError::Database(DbError::SqlxError(sqlx::Error::PoolTimedOut))
            | CadenceError::Database(DbError::SqlxError(sqlx::Error::Io(_))) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Stored value is corrupt: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Corrupt(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Vault key error: {0}")]
    Key(String),

    #[error("Failed to seal secret: {0}")]
    Seal(String),

    #[error("Failed to open secret: {0}")]
    Open(String),

    #[error("Security violation: {0}")]
    Security(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Account not found: {0}")]
    UnknownAccount(String),

    #[error("Content item not found: {0}")]
    UnknownContent(String),

    #[error("Queue slot not found: {0}")]
    UnknownSlot(String),

    #[error("No schedule configured for account {0}")]
    NoScheduleConfigured(String),

    #[error("No slot available for account {account_id} within {horizon_days} days")]
    NoSlotAvailable {
        account_id: String,
        horizon_days: i64,
    },

    #[error("Account {account_id} is {status} and cannot be scheduled")]
    AccountNotActive { account_id: String, status: String },

    #[error("Content item {content_id} is {status} and cannot be scheduled")]
    NotSchedulable { content_id: String, status: String },

    #[error("Invalid recurrence rule: {0}")]
    InvalidRule(String),

    #[error("Invalid queue order: {0}")]
    InvalidOrder(String),
}

/// Closed publish failure taxonomy.
///
/// Each variant carries structured fields so callers never match on message
/// text. `code()` yields the stable identifier written to publish outcomes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Content item {content_id} is {status} and cannot be published")]
    NotPublishable { content_id: String, status: String },

    #[error("Account {account_id} is {status}")]
    AccountNotActive { account_id: String, status: String },

    #[error("Credential unavailable for {account_id} ({code}): {message}")]
    CredentialUnavailable {
        account_id: String,
        code: String,
        message: String,
        terminal: bool,
    },

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Platform rejected request ({code}): {message}")]
    ClientError { code: String, message: String },

    #[error("Platform unavailable: {message}")]
    ServerError { message: String },
}

impl PublishError {
    /// Stable failure code recorded on outcomes and items
    pub fn code(&self) -> &str {
        match self {
            PublishError::NotPublishable { .. } => "NotPublishable",
            PublishError::AccountNotActive { .. } => "AccountNotActive",
            PublishError::CredentialUnavailable { code, .. } => code,
            PublishError::RateLimited { .. } => "RateLimited",
            PublishError::ClientError { code, .. } => code,
            PublishError::ServerError { .. } => "ServerError",
        }
    }

    /// Retryable at the item level by the job runner
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::ServerError { .. } => true,
            PublishError::CredentialUnavailable { terminal, .. } => !terminal,
            PublishError::NotPublishable { .. }
            | PublishError::AccountNotActive { .. }
            | PublishError::RateLimited { .. }
            | PublishError::ClientError { .. } => false,
        }
    }
}

/// Failure reported by a platform adapter.
///
/// Adapters translate transport-level outcomes into this shape; the broker and
/// orchestrator classify it into [`PublishError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("client error ({code}): {message}")]
    Client { code: String, message: String },

    #[error("grant rejected: {message}")]
    InvalidGrant { message: String },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}
