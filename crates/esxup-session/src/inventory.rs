use log::debug;

use crate::error::SessionError;
use crate::traits::RemoteSession;

const ESX_BASE_VIB: &str = "esx-base";

/// Kernel release of the host, for example `6.5.0`.
///
/// # Errors
/// Returns an error when the command fails or reports nothing.
pub async fn os_version(
    session: &dyn RemoteSession,
    host: &str,
) -> Result<String, SessionError> {
    let output = session.exec("uname -r").await?;
    let version = output.trim();
    if version.is_empty() {
        return Err(SessionError::inventory(host, "OS version", "empty uname output"));
    }
    Ok(version.to_string())
}

/// Installed `esx-base` VIB version from the host's software inventory.
///
/// # Errors
/// Returns an error when the command fails or the listing carries no
/// `esx-base` row.
pub async fn installed_version(
    session: &dyn RemoteSession,
    host: &str,
) -> Result<String, SessionError> {
    let listing = session.exec("esxcli software vib list").await?;
    parse_installed_version(&listing).ok_or_else(|| {
        SessionError::inventory(host, "installed version", "no esx-base row in vib listing")
    })
}

/// Latest matching `esx-base` version offered by the remote depot.
///
/// The depot is reachable from the host only once the `httpClient`
/// firewall ruleset is enabled, so that is switched on first. Rows are
/// scoped by the host's OS version; `Update`-channel rows win over
/// `Installed` rows, last match wins within a channel.
///
/// # Errors
/// Returns an error when a command fails or the depot offers no matching
/// row at all.
pub(crate) async fn depot_version(
    session: &dyn RemoteSession,
    host: &str,
    depot_url: &str,
    os_version: &str,
) -> Result<String, SessionError> {
    session
        .exec("esxcli network firewall ruleset set -e true -r httpClient")
        .await?;
    let listing = session
        .exec(&format!("esxcli software sources vib list -d {depot_url}"))
        .await?;
    debug!("depot listing: {} bytes", listing.len());
    parse_depot_version(&listing, os_version).ok_or_else(|| {
        SessionError::inventory(host, "depot version", format!("no {ESX_BASE_VIB} row for {os_version}"))
    })
}

fn parse_installed_version(listing: &str) -> Option<String> {
    listing
        .lines()
        .find(|line| line.split_whitespace().next() == Some(ESX_BASE_VIB))
        .and_then(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
}

fn parse_depot_version(listing: &str, os_version: &str) -> Option<String> {
    last_channel_match(listing, os_version, "Update")
        .or_else(|| last_channel_match(listing, os_version, "Installed"))
}

fn last_channel_match(listing: &str, os_version: &str, channel: &str) -> Option<String> {
    listing
        .lines()
        .filter(|line| {
            line.contains(os_version)
                && line.contains(ESX_BASE_VIB)
                && line.contains(channel)
        })
        .filter_map(|line| line.split_whitespace().nth(1))
        .next_back()
        .map(str::to_string)
}
