//! Domain errors shared by connectors, stores, and the broker.
//!
//! Infrastructure failures (database, startup) travel as [`color_eyre::Report`]
//! and surface here as [`BrokerError::Internal`]. Everything else has a named
//! variant so callers can decide whether a failure is terminal.

use axum::http::StatusCode;
use clients::switchboard::v1::ConnectorType;
use color_eyre::Report;
use derive_more::Display;

use crate::auth::IntegrationId;

#[derive(Debug, Display)]
pub enum BrokerError {
    /// The provider refused to exchange an authorization grant.
    #[display("authorization exchange failed: {reason}")]
    AuthExchangeFailed { reason: String },

    /// The connector cannot refresh this credential; re-authorization is
    /// required.
    #[display("{connector} does not support refreshing credentials")]
    RefreshUnsupported { connector: ConnectorType },

    /// The connector does not implement an optional capability.
    #[display("{connector} does not support {capability}")]
    NotSupported {
        connector: ConnectorType,
        capability: &'static str,
    },

    /// A webhook signature was missing or did not match.
    #[display("webhook signature is missing or invalid")]
    SignatureInvalid,

    #[display("no credential stored for integration {integration}")]
    CredentialNotFound { integration: IntegrationId },

    #[display("credential for integration {integration} has expired")]
    CredentialExpired { integration: IntegrationId },

    /// The provider says the credential is no longer valid.
    #[display("provider rejected the credential: {reason}")]
    CredentialRejected { reason: String },

    /// An authorization `state` failed verification or expired.
    #[display("authorization state is invalid or expired")]
    InvalidState,

    #[display("integration {integration} not found")]
    IntegrationNotFound { integration: IntegrationId },

    #[display("installation {installation_id} is not available to claim")]
    InstallationUnavailable { installation_id: i64 },

    /// An inbound payload could not be parsed.
    #[display("invalid payload: {_0}")]
    InvalidPayload(String),

    #[display("connector {connector} is not configured")]
    ConnectorNotConfigured { connector: ConnectorType },

    /// The connection to the provider failed or returned garbage.
    #[display("transport failure: {_0}")]
    TransportFailure(String),

    #[display("encryption failure: {_0}")]
    EncryptionFailure(String),

    #[display("{_0}")]
    Internal(Report),
}

impl BrokerError {
    /// Build a [`BrokerError::TransportFailure`] from any displayable error,
    /// keeping its source chain in the message.
    pub fn transport(error: impl std::fmt::Display) -> Self {
        Self::TransportFailure(format!("{error:#}"))
    }

    /// The HTTP status code used when this error reaches an API caller.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthExchangeFailed { .. } => StatusCode::BAD_REQUEST,
            Self::RefreshUnsupported { .. } => StatusCode::CONFLICT,
            Self::NotSupported { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::SignatureInvalid => StatusCode::UNAUTHORIZED,
            Self::CredentialNotFound { .. } => StatusCode::NOT_FOUND,
            Self::CredentialExpired { .. } => StatusCode::UNAUTHORIZED,
            Self::CredentialRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidState => StatusCode::BAD_REQUEST,
            Self::IntegrationNotFound { .. } => StatusCode::NOT_FOUND,
            Self::InstallationUnavailable { .. } => StatusCode::CONFLICT,
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::ConnectorNotConfigured { .. } => StatusCode::NOT_FOUND,
            Self::TransportFailure(_) => StatusCode::BAD_GATEWAY,
            Self::EncryptionFailure(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransportFailure(_) | Self::Internal(_))
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Internal(report) => Some(&**report),
            _ => None,
        }
    }
}

impl From<Report> for BrokerError {
    fn from(report: Report) -> Self {
        Self::Internal(report)
    }
}
