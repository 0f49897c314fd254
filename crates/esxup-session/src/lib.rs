//! Session-facing seam for esxup.
//!
//! Everything that touches a live host goes through the traits defined
//! here: [`Connector`] and [`RemoteSession`] abstract the transport,
//! [`Interaction`] abstracts operator prompts, and [`Orchestrator`] runs
//! the connect/inventory/decide/apply state machine on top of them. The
//! credential store and resolver also live here since they feed directly
//! into session establishment.

mod credentials;
mod error;
mod inventory;
mod orchestrator;
mod traits;

pub use credentials::{
    Credential, CredentialStore, default_store_path, resolve, tighten_permissions,
};
pub use error::{SessionError, TransportError};
pub use inventory::{installed_version, os_version};
pub use orchestrator::{ActionRequest, Intent, Orchestrator, WorkflowOutcome};
pub use traits::{Connector, Interaction, RemoteSession};
