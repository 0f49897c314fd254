use thiserror::Error;

/// Failures raised by the transport layer.
///
/// [`TransportError::HostKeyMismatch`] is only meaningful from
/// [`crate::Connector::connect`]; everything else maps to
/// [`TransportError::Failed`] with the operation that broke.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("host key for {host} has changed since it was last recorded")]
    HostKeyMismatch { host: String },

    #[error("{context} on {host} failed: {details}")]
    Failed {
        host: String,
        context: &'static str,
        details: String,
    },
}

impl TransportError {
    pub fn failed(host: impl Into<String>, context: &'static str, details: impl Into<String>) -> Self {
        Self::Failed {
            host: host.into(),
            context,
            details: details.into(),
        }
    }
}

/// Terminal failures of an orchestrated action.
///
/// Declined confirmations are not errors; they surface as
/// [`crate::WorkflowOutcome`] variants instead.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("host key for {host} changed again after being accepted")]
    TrustRetryExhausted { host: String },

    #[error("could not determine {field} of {host}: {details}")]
    Inventory {
        host: String,
        field: &'static str,
        details: String,
    },

    #[error(transparent)]
    Bundle(#[from] esxup_core::BundleError),
}

impl SessionError {
    pub fn inventory(
        host: impl Into<String>,
        field: &'static str,
        details: impl Into<String>,
    ) -> Self {
        Self::Inventory {
            host: host.into(),
            field,
            details: details.into(),
        }
    }
}
