//! Core error types.

use thiserror::Error;

/// Error reported by a runner, boxed so each backend can use its own type.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Kinds of structural query errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralErrorKind {
    /// Operator token is not recognized.
    UnknownOperator,
    /// Modifier is repeated or not valid for the operator.
    InvalidModifier,
    /// Bucket is not registered in the catalog.
    UnknownBucket,
    /// Field is not declared on the bucket.
    UnknownField,
    /// `#and` / `#or` key or its value is malformed.
    MalformedGroup,
    /// `{'.': ..}`, `{'$': ..}` or `{'@bucket.field': ..}` marker is malformed.
    MalformedMarker,
    /// Static value has the wrong shape for the operator.
    InvalidValue,
    /// Key has no field path.
    EmptyFieldPath,
    /// Query references parameters but none were supplied.
    MissingParams,
    /// Compile limits were exceeded.
    LimitExceeded,
    /// Part dependencies form a cycle.
    CyclicPlan,
}

/// The query object is malformed.
///
/// Always fatal and reported at compile time, before any backend call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StructuralError {
    /// Error kind for programmatic handling.
    pub kind: StructuralErrorKind,
    /// The query key the error was found at, if any.
    pub key: Option<String>,
    /// The error message.
    pub message: String,
}

impl StructuralError {
    /// Create a new structural error.
    pub fn new(kind: StructuralErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            key: None,
            message: message.into(),
        }
    }

    /// Attach the offending query key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Create an unknown operator error.
    pub fn unknown_operator(key: &str, token: &str) -> Self {
        Self::new(
            StructuralErrorKind::UnknownOperator,
            format!("unknown operator '{}' in key '{}'", token, key),
        )
        .with_key(key)
    }

    /// Create an invalid modifier error.
    pub fn invalid_modifier(key: &str, detail: impl AsRef<str>) -> Self {
        Self::new(
            StructuralErrorKind::InvalidModifier,
            format!("invalid modifier in key '{}': {}", key, detail.as_ref()),
        )
        .with_key(key)
    }

    /// Create an unknown bucket error.
    pub fn unknown_bucket(bucket: &str) -> Self {
        Self::new(
            StructuralErrorKind::UnknownBucket,
            format!("unknown bucket '{}'", bucket),
        )
    }

    /// Create an unknown field error.
    pub fn unknown_field(bucket: &str, field: &str) -> Self {
        Self::new(
            StructuralErrorKind::UnknownField,
            format!("unknown field '{}' on bucket '{}'", field, bucket),
        )
    }

    /// Create a malformed boolean group error.
    pub fn malformed_group(key: &str, detail: impl AsRef<str>) -> Self {
        Self::new(
            StructuralErrorKind::MalformedGroup,
            format!("malformed boolean group '{}': {}", key, detail.as_ref()),
        )
        .with_key(key)
    }

    /// Create a malformed marker error.
    pub fn malformed_marker(key: &str, detail: impl AsRef<str>) -> Self {
        Self::new(
            StructuralErrorKind::MalformedMarker,
            format!("malformed value marker for '{}': {}", key, detail.as_ref()),
        )
        .with_key(key)
    }

    /// Create an invalid value error.
    pub fn invalid_value(key: &str, detail: impl AsRef<str>) -> Self {
        Self::new(
            StructuralErrorKind::InvalidValue,
            format!("invalid value for '{}': {}", key, detail.as_ref()),
        )
        .with_key(key)
    }

    /// Create a limit exceeded error.
    pub fn limit_exceeded(detail: impl Into<String>) -> Self {
        Self::new(StructuralErrorKind::LimitExceeded, detail)
    }
}

/// Errors surfaced by compiling or executing a query.
#[derive(Debug, Error)]
pub enum Error {
    /// The query object is malformed.
    #[error("structural query error: {0}")]
    Structural(#[from] StructuralError),

    /// A part reached execution with a reference its runner cannot evaluate.
    #[error("unresolved scope in part {part} of bucket '{bucket}': {detail}")]
    UnresolvedScope {
        /// Part id.
        part: usize,
        /// Root bucket of the part.
        bucket: String,
        /// What was left unresolved.
        detail: String,
    },

    /// A runner failed to execute its part.
    #[error("backend error in bucket '{bucket}' (scope '{scope}'): {source}")]
    Backend {
        /// Root bucket of the failing part.
        bucket: String,
        /// Scope of the failing runner.
        scope: String,
        /// The runner's error.
        #[source]
        source: BackendError,
    },

    /// The execution context was cancelled.
    #[error("query execution cancelled")]
    Cancelled,

    /// Caller input could not be read.
    #[error("protocol error: {0}")]
    Protocol(#[from] nql_proto::Error),
}

impl Error {
    /// Check if this error is a structural query error.
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::Structural(_))
    }

    /// Get the structural error kind, if any.
    pub fn structural_kind(&self) -> Option<StructuralErrorKind> {
        match self {
            Error::Structural(e) => Some(e.kind),
            _ => None,
        }
    }
}
