use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use esxup_core::{SyncStatus, find_patch, list_local_patches, load_catalog, sync};
use esxup_session::{
    ActionRequest, Credential, CredentialStore, Intent, Interaction, Orchestrator, RemoteSession,
    WorkflowOutcome, default_store_path, resolve,
};
use esxup_ssh::{SshConnector, default_known_hosts_path};

use crate::cli::{Cli, Command, LicenseAction, PatchesAction};
use crate::prompt::TerminalPrompts;

const STAGED_BACKUP_DIR: &str = "/scratch/downloads";

pub async fn run(cli: Cli) -> Result<()> {
    let Cli {
        command,
        host,
        username,
        password,
        assume_yes,
        password_file,
        patch_dir,
        depot_url,
        timeout,
        ..
    } = cli;

    let patch_dir = patch_dir.unwrap_or_else(|| PathBuf::from("patches"));

    // Repository actions are purely local; no host or credential needed.
    let command = match command {
        Command::Patches { action } => return run_patches(action, &patch_dir).await,
        other => other,
    };

    let prompts = TerminalPrompts;
    let host = resolve_host(host, &prompts);

    let store = password_file
        .or_else(default_store_path)
        .and_then(|path| CredentialStore::load(&path));
    let credential = resolve(
        username.as_deref(),
        password.as_deref(),
        &host,
        store.as_ref(),
        &prompts,
    );

    log::debug!("acting as {} on {host}", credential.username);

    let known_hosts =
        default_known_hosts_path().context("could not determine the home directory")?;
    let connector = SshConnector::new(known_hosts).with_timeout(Duration::from_secs(timeout));
    let orchestrator = Orchestrator::new(&connector, &prompts);

    match command {
        Command::Check { file } => {
            let request =
                build_request(host, Intent::Check, file, &patch_dir, assume_yes, false, depot_url)?;
            run_workflow(&orchestrator, &request, &credential).await
        }
        Command::Update { file, reboot } => {
            let request = build_request(
                host,
                Intent::Update,
                file,
                &patch_dir,
                assume_yes,
                reboot,
                depot_url,
            )?;
            run_workflow(&orchestrator, &request, &credential).await
        }
        Command::Inspect { file } => {
            let request = build_request(
                host,
                Intent::Inspect,
                file,
                &patch_dir,
                assume_yes,
                false,
                depot_url,
            )?;
            run_workflow(&orchestrator, &request, &credential).await
        }
        Command::Backup { output } => {
            run_backup(&orchestrator, host, assume_yes, depot_url, output, &credential).await
        }
        Command::License { action } => {
            let command = match action {
                LicenseAction::Show => "vim-cmd vimsvc/license --show".to_string(),
                LicenseAction::Set { key } => format!("vim-cmd vimsvc/license --set {key}"),
            };
            run_command(&orchestrator, host, assume_yes, depot_url, &command, &credential).await
        }
        Command::Reboot => {
            run_command(&orchestrator, host, assume_yes, depot_url, "reboot", &credential).await
        }
        Command::Shutdown => {
            run_command(&orchestrator, host, assume_yes, depot_url, "halt", &credential).await
        }
        Command::Exec { command } => {
            run_command(
                &orchestrator,
                host,
                assume_yes,
                depot_url,
                &command.join(" "),
                &credential,
            )
            .await
        }
        Command::Patches { .. } => unreachable!("handled before credential resolution"),
    }
}

fn resolve_host(host: Option<String>, prompts: &TerminalPrompts) -> String {
    if let Some(host) = host.filter(|h| h.chars().any(char::is_alphanumeric)) {
        return host;
    }
    loop {
        let entered = prompts.prompt("Hostname");
        if entered.chars().any(char::is_alphanumeric) {
            return entered;
        }
    }
}

fn build_request(
    host: String,
    intent: Intent,
    file: Option<String>,
    patch_dir: &Path,
    auto_confirm: bool,
    reboot: bool,
    depot_url: String,
) -> Result<ActionRequest> {
    let artifact = match file {
        Some(reference) => {
            let path = find_patch(&reference, patch_dir)?;
            println!("File:  {}", path.display());
            Some(path)
        }
        None => None,
    };
    Ok(ActionRequest {
        host,
        intent,
        artifact,
        auto_confirm,
        reboot,
        depot_url,
    })
}

async fn run_workflow(
    orchestrator: &Orchestrator<'_>,
    request: &ActionRequest,
    credential: &Credential,
) -> Result<()> {
    let outcome = orchestrator
        .run(request, credential)
        .await
        .with_context(|| format!("update workflow against {} failed", request.host))?;

    match outcome {
        WorkflowOutcome::TrustDeclined => {
            println!("Host key not accepted, aborting");
        }
        WorkflowOutcome::Checked(decision) | WorkflowOutcome::UpToDate(decision) => {
            report_decision(&decision);
        }
        WorkflowOutcome::Applied {
            decision,
            output,
            rebooted,
        } => {
            report_decision(&decision);
            println!("{output}");
            if rebooted {
                println!("Rebooting");
            }
        }
        WorkflowOutcome::Simulated { decision, output } => {
            report_decision(&decision);
            println!("Performing dry run - no updates will be installed");
            println!("{output}");
        }
    }
    Ok(())
}

fn report_decision(decision: &esxup_core::UpdateDecision) {
    println!("Current:   {}", decision.current);
    println!("Available: {}", decision.available);
    if decision.update_available() {
        println!("Depot patch level is newer than installed version");
    } else {
        println!("Local patch level is up to date");
    }
}

/// Open a trust-checked session for a direct command.
async fn open_session(
    orchestrator: &Orchestrator<'_>,
    host: String,
    auto_confirm: bool,
    depot_url: String,
    credential: &Credential,
) -> Result<Option<Box<dyn RemoteSession>>> {
    let request = ActionRequest {
        host: host.clone(),
        intent: Intent::Inspect,
        artifact: None,
        auto_confirm,
        reboot: false,
        depot_url,
    };
    orchestrator
        .open_session(&request, credential)
        .await
        .with_context(|| format!("could not open a session to {host}"))
}

async fn run_command(
    orchestrator: &Orchestrator<'_>,
    host: String,
    auto_confirm: bool,
    depot_url: String,
    command: &str,
    credential: &Credential,
) -> Result<()> {
    println!("Server:  {host}");
    println!("Command: {command}");

    let Some(session) =
        open_session(orchestrator, host.clone(), auto_confirm, depot_url, credential).await?
    else {
        println!("Host key not accepted, aborting");
        return Ok(());
    };

    let output = session
        .exec(command)
        .await
        .with_context(|| format!("command on {host} failed"))?;
    println!("{output}");
    Ok(())
}

async fn run_backup(
    orchestrator: &Orchestrator<'_>,
    host: String,
    auto_confirm: bool,
    depot_url: String,
    output: Option<PathBuf>,
    credential: &Credential,
) -> Result<()> {
    let Some(session) =
        open_session(orchestrator, host.clone(), auto_confirm, depot_url, credential).await?
    else {
        println!("Host key not accepted, aborting");
        return Ok(());
    };

    let command_output = session
        .exec("vim-cmd hostsvc/firmware/backup_config")
        .await
        .with_context(|| format!("configuration backup on {host} failed"))?;
    println!("{command_output}");

    let Some(remote_path) = backup_remote_path(&command_output) else {
        bail!("backup on {host} reported no bundle location");
    };
    let local_path = output.unwrap_or_else(|| {
        let name = remote_path.rsplit('/').next().unwrap_or("configBundle.tgz");
        Path::new("/tmp").join(name)
    });

    println!("Copying: {host}:{remote_path} to {}", local_path.display());
    session
        .download(&remote_path, &local_path)
        .await
        .with_context(|| format!("could not download backup bundle from {host}"))?;
    Ok(())
}

/// The backup command reports a download URL; the bundle itself sits
/// under the host's staged-downloads directory at the URL's last two
/// path segments.
fn backup_remote_path(output: &str) -> Option<String> {
    let segments: Vec<&str> = output.trim().split('/').collect();
    if segments.len() < 2 {
        return None;
    }
    let dir = segments[segments.len() - 2];
    let file = segments[segments.len() - 1].trim();
    if file.is_empty() {
        return None;
    }
    Some(format!("{STAGED_BACKUP_DIR}/{dir}/{file}"))
}

async fn run_patches(action: PatchesAction, patch_dir: &Path) -> Result<()> {
    match action {
        PatchesAction::List => {
            for name in list_local_patches(patch_dir) {
                println!("{name}");
            }
            Ok(())
        }
        PatchesAction::Find { reference } => {
            println!("Patch: {reference}");
            let path = find_patch(&reference, patch_dir)?;
            println!("File:  {}", path.display());
            Ok(())
        }
        PatchesAction::Sync { catalog, download } => {
            let entries = load_catalog(&catalog)?;
            let client = reqwest::Client::new();
            let outcomes = sync(&client, &entries, patch_dir, download).await;

            let mut failures = 0usize;
            for outcome in &outcomes {
                println!("Update:   {}", outcome.entry.id);
                println!("Download: {}", outcome.entry.url);
                match &outcome.status {
                    SyncStatus::Present => println!("Present:  {}", outcome.local_path.display()),
                    SyncStatus::Missing => println!("Missing:  {}", outcome.local_path.display()),
                    SyncStatus::Fetched => println!("Fetched:  {}", outcome.local_path.display()),
                    SyncStatus::FetchFailed(details) => {
                        failures += 1;
                        println!("Failed:   {details}");
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} of {} catalog entries failed to fetch", outcomes.len());
            }
            Ok(())
        }
    }
}
