use std::path::PathBuf;

use log::{info, warn};

use esxup_core::{Policy, UpdateDecision, bundle_version, decide};

use crate::credentials::Credential;
use crate::error::{SessionError, TransportError};
use crate::inventory;
use crate::traits::{Connector, Interaction, RemoteSession};

const STAGING_DIR: &str = "/scratch/downloads";
const REBOOT_REQUIRED_MARKER: &str = "Reboot Required: true";

/// What the invocation is ultimately for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Report whether an update exists; never mutate.
    Check,
    /// Apply the update when one exists.
    Update,
    /// Raw inspection: report under the strict-numeric-floor policy.
    Inspect,
}

/// Immutable description of one orchestrated action, built once by the
/// CLI layer and passed through the whole workflow.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub host: String,
    pub intent: Intent,
    /// Local patch bundle; when absent the remote depot is queried.
    pub artifact: Option<PathBuf>,
    pub auto_confirm: bool,
    pub reboot: bool,
    pub depot_url: String,
}

impl ActionRequest {
    fn policy(&self) -> Policy {
        match self.intent {
            Intent::Check | Intent::Update => Policy::NewerIsBetter,
            Intent::Inspect => Policy::StrictNumericFloor,
        }
    }
}

/// Terminal state of a completed workflow. Declined confirmations are
/// ordinary terminations, not errors.
#[derive(Debug)]
pub enum WorkflowOutcome {
    /// Operator declined to accept a changed host identity.
    TrustDeclined,
    /// Decision reported; the intent never included applying it.
    Checked(UpdateDecision),
    /// Update intent, but the host is already current.
    UpToDate(UpdateDecision),
    Applied {
        decision: UpdateDecision,
        output: String,
        rebooted: bool,
    },
    Simulated {
        decision: UpdateDecision,
        output: String,
    },
}

/// Drives one action against one host: connect (with a single bounded
/// trust retry), inventory, decide, confirm, apply or simulate.
pub struct Orchestrator<'a> {
    connector: &'a dyn Connector,
    interaction: &'a dyn Interaction,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(connector: &'a dyn Connector, interaction: &'a dyn Interaction) -> Self {
        Self {
            connector,
            interaction,
        }
    }

    /// Run the full workflow for `request`.
    ///
    /// # Errors
    /// Returns an error on transport failure, on a host identity that
    /// keeps changing after being accepted, or when inventory or bundle
    /// metadata cannot be resolved.
    pub async fn run(
        &self,
        request: &ActionRequest,
        credential: &Credential,
    ) -> Result<WorkflowOutcome, SessionError> {
        let Some(session) = self.open_session(request, credential).await? else {
            return Ok(WorkflowOutcome::TrustDeclined);
        };

        let os_version = inventory::os_version(session.as_ref(), &request.host).await?;
        let local_version = inventory::installed_version(session.as_ref(), &request.host).await?;
        let available_version = match &request.artifact {
            Some(artifact) => bundle_version(artifact)?,
            None => {
                inventory::depot_version(
                    session.as_ref(),
                    &request.host,
                    &request.depot_url,
                    &os_version,
                )
                .await?
            }
        };

        let decision = decide(&local_version, &available_version, request.policy());
        info!("Current:   {}", decision.current);
        info!("Available: {}", decision.available);

        if request.intent != Intent::Update {
            return Ok(WorkflowOutcome::Checked(decision));
        }
        if !decision.update_available() {
            info!("local patch level is up to date");
            return Ok(WorkflowOutcome::UpToDate(decision));
        }

        let confirmed = request.auto_confirm || self.interaction.confirm("Install update");

        let locator = match &request.artifact {
            Some(artifact) => self.stage_artifact(session.as_ref(), request, artifact).await?,
            None => request.depot_url.clone(),
        };

        if confirmed {
            info!("installing {} from {locator}", decision.available);
            let output = session
                .exec(&format!("esxcli software vib update -d={locator}"))
                .await?;
            let rebooted = self
                .reboot_if_required(session.as_ref(), request, &output)
                .await;
            Ok(WorkflowOutcome::Applied {
                decision,
                output,
                rebooted,
            })
        } else {
            info!("performing dry run, no updates will be installed");
            let output = session
                .exec(&format!("esxcli software vib update -d={locator} --dry-run"))
                .await?;
            Ok(WorkflowOutcome::Simulated { decision, output })
        }
    }

    /// Connect, allowing exactly one retry after an accepted host-key
    /// change. `Ok(None)` means the operator declined the new identity.
    ///
    /// Exposed on its own because direct actions (backup, license,
    /// power control) need the same trust handling without the update
    /// workflow.
    ///
    /// # Errors
    /// Returns an error on transport failure or when the host identity
    /// changes again after being accepted.
    pub async fn open_session(
        &self,
        request: &ActionRequest,
        credential: &Credential,
    ) -> Result<Option<Box<dyn RemoteSession>>, SessionError> {
        let mut accept_changed_key = false;

        loop {
            match self
                .connector
                .connect(&request.host, credential, accept_changed_key)
                .await
            {
                Ok(session) => return Ok(Some(session)),
                Err(TransportError::HostKeyMismatch { host }) => {
                    if accept_changed_key {
                        return Err(SessionError::TrustRetryExhausted { host });
                    }
                    warn!("existing key found for {host} no longer matches");
                    let accepted = request.auto_confirm
                        || self
                            .interaction
                            .confirm(&format!("Update host key for {host}"));
                    if !accepted {
                        return Ok(None);
                    }
                    info!("updating host key for {host}");
                    accept_changed_key = true;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn stage_artifact(
        &self,
        session: &dyn RemoteSession,
        request: &ActionRequest,
        artifact: &std::path::Path,
    ) -> Result<String, SessionError> {
        let file_name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                SessionError::inventory(&request.host, "staging path", "artifact has no file name")
            })?;
        let remote_path = format!("{STAGING_DIR}/{file_name}");

        session.exec(&format!("mkdir -p {STAGING_DIR}")).await?;
        info!(
            "copying {} to {}:{remote_path}",
            artifact.display(),
            request.host
        );
        session.upload(artifact, &remote_path).await?;
        Ok(remote_path)
    }

    /// Reboot is fire-and-forget: the command is issued and the session
    /// is not expected to survive it, so a transport error here only
    /// logs.
    async fn reboot_if_required(
        &self,
        session: &dyn RemoteSession,
        request: &ActionRequest,
        output: &str,
    ) -> bool {
        if !(request.reboot && output.contains(REBOOT_REQUIRED_MARKER)) {
            return false;
        }
        info!("rebooting {}", request.host);
        if let Err(error) = session.exec("reboot").await {
            warn!("reboot command on {} reported: {error}", request.host);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use esxup_core::Outcome;

    use super::*;

    const DEPOT_URL: &str = "http://depot.example.com/index.xml";

    fn vib_listing(local_version: &str) -> String {
        format!("esx-base  {local_version}  VMware  VMwareCertified  2017-07-29\n")
    }

    fn depot_listing(available_version: &str) -> String {
        format!("esx-base  {available_version}  VMware  2017-07-06  VMwareCertified  Update\n")
    }

    /// Canned host: answers the inventory commands from fixed versions
    /// and records everything executed against it.
    struct FakeHost {
        local_version: String,
        available_version: String,
        update_output: String,
        commands: Mutex<Vec<String>>,
        uploads: Mutex<Vec<String>>,
    }

    impl FakeHost {
        fn new(local_version: &str, available_version: &str) -> Self {
            Self {
                local_version: local_version.to_string(),
                available_version: available_version.to_string(),
                update_output: "Update Result\n   Reboot Required: false\n".to_string(),
                commands: Mutex::new(Vec::new()),
                uploads: Mutex::new(Vec::new()),
            }
        }

        fn with_update_output(mut self, output: &str) -> Self {
            self.update_output = output.to_string();
            self
        }

        fn shared(self) -> Arc<Self> {
            Arc::new(self)
        }

        fn executed(&self) -> Vec<String> {
            self.commands.lock().expect("command log lock").clone()
        }

        fn executed_matching(&self, needle: &str) -> Vec<String> {
            self.executed()
                .into_iter()
                .filter(|command| command.contains(needle))
                .collect()
        }
    }

    struct FakeSession {
        host: Arc<FakeHost>,
    }

    #[async_trait]
    impl RemoteSession for FakeSession {
        async fn exec(&self, command: &str) -> Result<String, TransportError> {
            self.host
                .commands
                .lock()
                .expect("command log lock")
                .push(command.to_string());

            if command == "uname -r" {
                Ok("6.5.0\n".to_string())
            } else if command == "esxcli software vib list" {
                Ok(vib_listing(&self.host.local_version))
            } else if command.starts_with("esxcli software sources vib list") {
                Ok(depot_listing(&self.host.available_version))
            } else if command.starts_with("esxcli software vib update") {
                Ok(self.host.update_output.clone())
            } else {
                Ok(String::new())
            }
        }

        async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
            self.host
                .uploads
                .lock()
                .expect("upload log lock")
                .push(format!("{} -> {remote}", local.display()));
            Ok(())
        }

        async fn download(&self, _remote: &str, _local: &Path) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Connector that raises a host-key mismatch for the first
    /// `mismatches` attempts, then hands out sessions over `host`.
    struct FakeConnector {
        host: Arc<FakeHost>,
        mismatches: usize,
        attempts: AtomicUsize,
    }

    impl FakeConnector {
        fn new(host: &Arc<FakeHost>) -> Self {
            Self {
                host: Arc::clone(host),
                mismatches: 0,
                attempts: AtomicUsize::new(0),
            }
        }

        fn with_mismatches(mut self, mismatches: usize) -> Self {
            self.mismatches = mismatches;
            self
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            host: &str,
            _credential: &Credential,
            _accept_changed_key: bool,
        ) -> Result<Box<dyn RemoteSession>, TransportError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.mismatches {
                return Err(TransportError::HostKeyMismatch {
                    host: host.to_string(),
                });
            }
            Ok(Box::new(FakeSession {
                host: Arc::clone(&self.host),
            }))
        }
    }

    struct Answers {
        confirm: bool,
        confirmations: AtomicUsize,
    }

    impl Answers {
        fn yes() -> Self {
            Self {
                confirm: true,
                confirmations: AtomicUsize::new(0),
            }
        }

        fn no() -> Self {
            Self {
                confirm: false,
                confirmations: AtomicUsize::new(0),
            }
        }

        fn asked(&self) -> usize {
            self.confirmations.load(Ordering::SeqCst)
        }
    }

    impl Interaction for Answers {
        fn confirm(&self, _question: &str) -> bool {
            self.confirmations.fetch_add(1, Ordering::SeqCst);
            self.confirm
        }

        fn prompt(&self, _label: &str) -> String {
            unreachable!("orchestrator never prompts for values")
        }

        fn prompt_secret(&self, _label: &str) -> String {
            unreachable!("orchestrator never prompts for secrets")
        }
    }

    fn request(intent: Intent) -> ActionRequest {
        ActionRequest {
            host: "esx01".to_string(),
            intent,
            artifact: None,
            auto_confirm: false,
            reboot: false,
            depot_url: DEPOT_URL.to_string(),
        }
    }

    fn credential() -> Credential {
        Credential {
            username: "root".to_string(),
            password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn check_only_reports_and_never_mutates() {
        let host = FakeHost::new("6.5.0-1", "6.5.0-3").shared();
        let connector = FakeConnector::new(&host);
        let interaction = Answers::yes();
        let orchestrator = Orchestrator::new(&connector, &interaction);

        let outcome = orchestrator
            .run(&request(Intent::Check), &credential())
            .await
            .expect("check workflow should complete");

        let WorkflowOutcome::Checked(decision) = outcome else {
            panic!("expected Checked, got {outcome:?}");
        };
        assert_eq!(decision.outcome, Outcome::UpdateAvailable);
        assert_eq!(decision.current, "1");
        assert_eq!(decision.available, "3");
        assert!(host.executed_matching("vib update").is_empty());
        assert_eq!(interaction.asked(), 0);
    }

    #[tokio::test]
    async fn up_to_date_update_intent_skips_apply_entirely() {
        let host = FakeHost::new("6.5.0-2", "6.5.0-2").shared();
        let connector = FakeConnector::new(&host);
        let interaction = Answers::yes();
        let orchestrator = Orchestrator::new(&connector, &interaction);

        let mut req = request(Intent::Update);
        req.auto_confirm = true;

        let outcome = orchestrator
            .run(&req, &credential())
            .await
            .expect("workflow should complete");

        assert!(matches!(outcome, WorkflowOutcome::UpToDate(_)));
        assert!(host.executed_matching("vib update").is_empty());
        assert!(host.uploads.lock().expect("upload log lock").is_empty());
    }

    #[tokio::test]
    async fn confirmed_update_applies_from_depot_locator() {
        let host = FakeHost::new("6.5.0-1", "6.5.0-2").shared();
        let connector = FakeConnector::new(&host);
        let interaction = Answers::yes();
        let orchestrator = Orchestrator::new(&connector, &interaction);

        let outcome = orchestrator
            .run(&request(Intent::Update), &credential())
            .await
            .expect("workflow should complete");

        let WorkflowOutcome::Applied { rebooted, .. } = outcome else {
            panic!("expected Applied, got {outcome:?}");
        };
        assert!(!rebooted);
        assert_eq!(
            host.executed_matching("vib update"),
            vec![format!("esxcli software vib update -d={DEPOT_URL}")]
        );
        assert_eq!(interaction.asked(), 1);
    }

    #[tokio::test]
    async fn declined_update_confirmation_runs_dry_run() {
        let host = FakeHost::new("6.5.0-1", "6.5.0-2").shared();
        let connector = FakeConnector::new(&host);
        let interaction = Answers::no();
        let orchestrator = Orchestrator::new(&connector, &interaction);

        let outcome = orchestrator
            .run(&request(Intent::Update), &credential())
            .await
            .expect("workflow should complete");

        assert!(matches!(outcome, WorkflowOutcome::Simulated { .. }));
        let updates = host.executed_matching("vib update");
        assert_eq!(updates.len(), 1);
        assert!(updates[0].ends_with("--dry-run"));
    }

    #[tokio::test]
    async fn reboot_issued_only_when_requested_and_required() {
        let host = FakeHost::new("6.5.0-1", "6.5.0-2")
            .with_update_output("Update Result\n   Reboot Required: true\n").shared();
        let connector = FakeConnector::new(&host);
        let interaction = Answers::yes();
        let orchestrator = Orchestrator::new(&connector, &interaction);

        let mut req = request(Intent::Update);
        req.auto_confirm = true;
        req.reboot = true;

        let outcome = orchestrator
            .run(&req, &credential())
            .await
            .expect("workflow should complete");

        let WorkflowOutcome::Applied { rebooted, .. } = outcome else {
            panic!("expected Applied, got {outcome:?}");
        };
        assert!(rebooted);
        assert_eq!(host.executed_matching("reboot"), vec!["reboot"]);
    }

    #[tokio::test]
    async fn reboot_not_issued_without_request_flag() {
        let host = FakeHost::new("6.5.0-1", "6.5.0-2")
            .with_update_output("Update Result\n   Reboot Required: true\n").shared();
        let connector = FakeConnector::new(&host);
        let interaction = Answers::yes();
        let orchestrator = Orchestrator::new(&connector, &interaction);

        let mut req = request(Intent::Update);
        req.auto_confirm = true;

        let outcome = orchestrator
            .run(&req, &credential())
            .await
            .expect("workflow should complete");

        let WorkflowOutcome::Applied { rebooted, .. } = outcome else {
            panic!("expected Applied, got {outcome:?}");
        };
        assert!(!rebooted);
        assert!(host.executed_matching("reboot").is_empty());
    }

    #[tokio::test]
    async fn accepted_trust_mismatch_retries_exactly_once() {
        let host = FakeHost::new("6.5.0-1", "6.5.0-3").shared();
        let connector = FakeConnector::new(&host).with_mismatches(1);
        let interaction = Answers::yes();
        let orchestrator = Orchestrator::new(&connector, &interaction);

        let outcome = orchestrator
            .run(&request(Intent::Check), &credential())
            .await
            .expect("retry should succeed");

        assert!(matches!(outcome, WorkflowOutcome::Checked(_)));
        assert_eq!(connector.attempts(), 2);
        assert_eq!(interaction.asked(), 1);
    }

    #[tokio::test]
    async fn declined_trust_mismatch_aborts_without_session_use() {
        let host = FakeHost::new("6.5.0-1", "6.5.0-3").shared();
        let connector = FakeConnector::new(&host).with_mismatches(1);
        let interaction = Answers::no();
        let orchestrator = Orchestrator::new(&connector, &interaction);

        let outcome = orchestrator
            .run(&request(Intent::Check), &credential())
            .await
            .expect("decline is a normal termination");

        assert!(matches!(outcome, WorkflowOutcome::TrustDeclined));
        assert_eq!(connector.attempts(), 1);
        assert!(host.executed().is_empty());
    }

    #[tokio::test]
    async fn repeated_mismatch_after_acceptance_fails() {
        let host = FakeHost::new("6.5.0-1", "6.5.0-3").shared();
        let connector = FakeConnector::new(&host).with_mismatches(2);
        let interaction = Answers::yes();
        let orchestrator = Orchestrator::new(&connector, &interaction);

        let error = orchestrator
            .run(&request(Intent::Check), &credential())
            .await
            .expect_err("second mismatch must fail");

        assert!(matches!(error, SessionError::TrustRetryExhausted { .. }));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn auto_confirm_covers_trust_update() {
        let host = FakeHost::new("6.5.0-1", "6.5.0-3").shared();
        let connector = FakeConnector::new(&host).with_mismatches(1);
        let interaction = Answers::no();
        let orchestrator = Orchestrator::new(&connector, &interaction);

        let mut req = request(Intent::Check);
        req.auto_confirm = true;

        let outcome = orchestrator
            .run(&req, &credential())
            .await
            .expect("auto-confirm should accept the new key");

        assert!(matches!(outcome, WorkflowOutcome::Checked(_)));
        assert_eq!(interaction.asked(), 0);
    }

    #[tokio::test]
    async fn inspect_intent_uses_floor_policy_and_stops_after_report() {
        // Equal build numbers: floor policy flags an update where
        // newer-is-better would not, and inspection still never applies.
        let host = FakeHost::new("6.5.0-2", "6.5.0-2").shared();
        let connector = FakeConnector::new(&host);
        let interaction = Answers::yes();
        let orchestrator = Orchestrator::new(&connector, &interaction);

        let outcome = orchestrator
            .run(&request(Intent::Inspect), &credential())
            .await
            .expect("inspection should complete");

        let WorkflowOutcome::Checked(decision) = outcome else {
            panic!("expected Checked, got {outcome:?}");
        };
        assert_eq!(decision.policy, esxup_core::Policy::StrictNumericFloor);
        assert_eq!(decision.outcome, Outcome::UpdateAvailable);
        assert!(host.executed_matching("vib update").is_empty());
    }

    #[tokio::test]
    async fn artifact_is_staged_before_apply() {
        let bundle_dir = tempfile::tempdir().expect("tempdir");
        let bundle_path = write_test_bundle(bundle_dir.path(), "ESXi-6.5.0-20170702001-standard");

        let host = FakeHost::new("6.5.0-1.23.4564106", "unused").shared();
        let connector = FakeConnector::new(&host);
        let interaction = Answers::yes();
        let orchestrator = Orchestrator::new(&connector, &interaction);

        let mut req = request(Intent::Update);
        req.auto_confirm = true;
        req.artifact = Some(bundle_path.clone());

        let outcome = orchestrator
            .run(&req, &credential())
            .await
            .expect("artifact update should complete");

        assert!(matches!(outcome, WorkflowOutcome::Applied { .. }));
        // Depot never queried when a local artifact supplies the version.
        assert!(host.executed_matching("sources vib list").is_empty());
        assert_eq!(host.executed_matching("mkdir").len(), 1);

        let uploads = host.uploads.lock().expect("upload log lock").clone();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].ends_with("-> /scratch/downloads/bundle.zip"));

        let updates = host.executed_matching("vib update");
        assert_eq!(
            updates,
            vec!["esxcli software vib update -d=/scratch/downloads/bundle.zip"]
        );
    }

    fn write_test_bundle(dir: &Path, standard_profile: &str) -> std::path::PathBuf {
        use std::io::Write as _;
        use zip::write::SimpleFileOptions;

        let mut metadata = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        metadata
            .start_file(
                format!("profiles/{standard_profile}"),
                SimpleFileOptions::default(),
            )
            .expect("start profile entry");
        let metadata = metadata.finish().expect("finish metadata zip").into_inner();

        let mut outer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        outer
            .start_file("metadata.zip", SimpleFileOptions::default())
            .expect("start metadata entry");
        outer.write_all(&metadata).expect("write metadata entry");
        let outer = outer.finish().expect("finish bundle zip").into_inner();

        let path = dir.join("bundle.zip");
        std::fs::write(&path, outer).expect("write bundle");
        path
    }
}
