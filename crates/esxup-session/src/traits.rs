use std::path::Path;

use async_trait::async_trait;

use crate::credentials::Credential;
use crate::error::TransportError;

/// One live connection to a target host.
///
/// Commands return combined textual output; there is no structured
/// exit-code contract beyond pattern matching on that text. Every call
/// blocks the workflow until the remote side finishes.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn exec(&self, command: &str) -> Result<String, TransportError>;

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError>;

    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransportError>;
}

/// Session factory.
///
/// Host identity is not cryptographically pinned; a changed identity is
/// still observable and surfaces as
/// [`TransportError::HostKeyMismatch`]. Passing `accept_changed_key`
/// tells the connector to record the new identity before retrying.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        credential: &Credential,
        accept_changed_key: bool,
    ) -> Result<Box<dyn RemoteSession>, TransportError>;
}

/// Operator interaction. Implemented against the terminal by the binary
/// and by scripted stand-ins in tests.
pub trait Interaction: Send + Sync {
    /// Ask a y/n question; returns once the operator answers either way.
    fn confirm(&self, question: &str) -> bool;

    /// Read one line with echo.
    fn prompt(&self, label: &str) -> String;

    /// Read one line without echoing it back.
    fn prompt_secret(&self, label: &str) -> String;
}
