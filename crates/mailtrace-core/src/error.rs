use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Auth,
    Network
}

/// Every failure the tracing core reports.
///
/// Each variant carries a factual `message` and an actionable `suggestion`
/// as separate fields. A missing relay or an exhausted hop chain is not an
/// error; those surface as `Ok(None)`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("{message}")]
    Connection {
        kind: ConnectionKind,
        message: String,
        suggestion: String
    },
    #[error("{message}")]
    Query { message: String, suggestion: String },
    #[error("{message}")]
    Parse { message: String, suggestion: String },
    #[error("{message}")]
    Validation { message: String, suggestion: String },
    #[error("{message}")]
    Config { message: String, suggestion: String }
}

impl TraceError {
    pub fn auth(
        message: impl Into<String>,
        suggestion: impl Into<String>
    ) -> Self {
        Self::Connection {
            kind: ConnectionKind::Auth,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn network(
        message: impl Into<String>,
        suggestion: impl Into<String>
    ) -> Self {
        Self::Connection {
            kind: ConnectionKind::Network,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn query(
        message: impl Into<String>,
        suggestion: impl Into<String>
    ) -> Self {
        Self::Query { message: message.into(), suggestion: suggestion.into() }
    }

    pub fn parse(
        message: impl Into<String>,
        suggestion: impl Into<String>
    ) -> Self {
        Self::Parse { message: message.into(), suggestion: suggestion.into() }
    }

    pub fn validation(
        message: impl Into<String>,
        suggestion: impl Into<String>
    ) -> Self {
        Self::Validation {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn config(
        message: impl Into<String>,
        suggestion: impl Into<String>
    ) -> Self {
        Self::Config { message: message.into(), suggestion: suggestion.into() }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Connection { message, .. }
            | Self::Query { message, .. }
            | Self::Parse { message, .. }
            | Self::Validation { message, .. }
            | Self::Config { message, .. } => message,
        }
    }

    pub fn suggestion(&self) -> &str {
        match self {
            Self::Connection { suggestion, .. }
            | Self::Query { suggestion, .. }
            | Self::Parse { suggestion, .. }
            | Self::Validation { suggestion, .. }
            | Self::Config { suggestion, .. } => suggestion,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection { kind: ConnectionKind::Auth, .. } => {
                "CONNECTION_AUTH"
            }
            Self::Connection { kind: ConnectionKind::Network, .. } => {
                "CONNECTION_NETWORK"
            }
            Self::Query { .. } => "QUERY",
            Self::Parse { .. } => "PARSE",
            Self::Validation { .. } => "VALIDATION",
            Self::Config { .. } => "CONFIG"
        }
    }
}
