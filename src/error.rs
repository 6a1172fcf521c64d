//! Top-level error types.
//!
//! Each sub-domain enum carries an [`ErrorKind`] on the variants that
//! need operator-visible classification, so callers can match on
//! kind uniformly while messages stay specific to the failing op.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification shared across all sub-domain errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputInvalid,
    PermissionDenied,
    NotFound,
    Duplicate,
    RateLimited,
    UpstreamTransient,
    UpstreamRefused,
    CacheStale,
    Degraded,
    Fatal,
}

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Observance(#[from] ObservanceError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Best-effort classification for operator-facing surfaces (ops status, logging level).
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(e) => e.kind(),
            Error::Datastore(e) => e.kind(),
            Error::Profile(e) => e.kind(),
            Error::Observance(e) => e.kind(),
            Error::Generation(e) => e.kind(),
            Error::Pipeline(e) => e.kind(),
            Error::Messaging(e) => e.kind(),
            Error::Io(_) => ErrorKind::UpstreamTransient,
            Error::Other(_) => ErrorKind::Fatal,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Fatal
    }
}

/// Datastore (JSON files, locks, backups) errors.
#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt JSON in {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("lock on {path} timed out after {timeout_secs}s")]
    LockTimeout { path: String, timeout_secs: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DatastoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DatastoreError::Read { .. } | DatastoreError::Write { .. } => {
                ErrorKind::UpstreamTransient
            }
            DatastoreError::Corrupt { .. } => ErrorKind::Fatal,
            DatastoreError::LockTimeout { .. } => ErrorKind::UpstreamTransient,
            DatastoreError::Other(_) => ErrorKind::Fatal,
        }
    }
}

/// Profile and membership resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("user {user_id} not found")]
    NotFound { user_id: String },

    #[error("platform request failed: {0}")]
    UpstreamTransient(String),

    #[error("platform rejected request: {0}")]
    UpstreamRefused(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProfileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProfileError::NotFound { .. } => ErrorKind::NotFound,
            ProfileError::UpstreamTransient(_) => ErrorKind::UpstreamTransient,
            ProfileError::UpstreamRefused(_) => ErrorKind::UpstreamRefused,
            ProfileError::Other(_) => ErrorKind::Fatal,
        }
    }
}

/// Observance source and aggregation errors.
#[derive(Debug, thiserror::Error)]
pub enum ObservanceError {
    #[error("source {source_name} upstream failed: {detail}")]
    UpstreamTransient { source_name: String, detail: String },

    #[error("source {source_name} refused request: {detail}")]
    UpstreamRefused { source_name: String, detail: String },

    #[error("source {source_name} cache is stale")]
    CacheStale { source_name: String },

    #[error("source {source_name} is disabled")]
    Degraded { source_name: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ObservanceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ObservanceError::UpstreamTransient { .. } => ErrorKind::UpstreamTransient,
            ObservanceError::UpstreamRefused { .. } => ErrorKind::UpstreamRefused,
            ObservanceError::CacheStale { .. } => ErrorKind::CacheStale,
            ObservanceError::Degraded { .. } => ErrorKind::Degraded,
            ObservanceError::Other(_) => ErrorKind::Fatal,
        }
    }
}

/// Message/image generation errors.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("completion request failed: {0}")]
    CompletionFailed(String),

    #[error("image generation failed: {0}")]
    ImageFailed(String),

    #[error("generation provider request failed: {0}")]
    UpstreamTransient(String),

    #[error("generation provider refused request: {0}")]
    UpstreamRefused(String),

    #[error("generation provider rate limited")]
    RateLimited,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::CompletionFailed(_) | GenerationError::ImageFailed(_) => {
                ErrorKind::Degraded
            }
            GenerationError::UpstreamTransient(_) => ErrorKind::UpstreamTransient,
            GenerationError::UpstreamRefused(_) => ErrorKind::UpstreamRefused,
            GenerationError::RateLimited => ErrorKind::RateLimited,
            GenerationError::Other(_) => ErrorKind::Fatal,
        }
    }
}

/// Pipeline orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no eligible people remained after validation")]
    NoEligiblePeople,

    #[error("celebration already recorded for {user_id} on {date_key}")]
    AlreadyCelebrated { user_id: String, date_key: String },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::NoEligiblePeople => ErrorKind::Degraded,
            PipelineError::AlreadyCelebrated { .. } => ErrorKind::Duplicate,
            PipelineError::InvalidTransition { .. } => ErrorKind::Fatal,
            PipelineError::Other(_) => ErrorKind::Fatal,
        }
    }
}

/// Chat platform / messaging adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("platform request failed: {0}")]
    UpstreamTransient(String),

    #[error("platform rejected request: {0}")]
    UpstreamRefused(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MessagingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MessagingError::UpstreamTransient(_) => ErrorKind::UpstreamTransient,
            MessagingError::UpstreamRefused(_) => ErrorKind::UpstreamRefused,
            MessagingError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            MessagingError::RateLimited { .. } => ErrorKind::RateLimited,
            MessagingError::InputInvalid(_) => ErrorKind::InputInvalid,
            MessagingError::Other(_) => ErrorKind::Fatal,
        }
    }
}
