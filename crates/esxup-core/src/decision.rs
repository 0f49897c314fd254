use std::fmt;

use log::debug;

use crate::version::{coerce_int, latest_of};

/// Comparison policy for an update decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Used for check/update actions: an update exists only when the
    /// available version is strictly newer than the installed one.
    NewerIsBetter,
    /// Used for every other action: an update is reported whenever the
    /// available integer value is *not below* the installed one. The
    /// asymmetry with [`Policy::NewerIsBetter`] is intentional; do not
    /// unify the two (see DESIGN.md).
    StrictNumericFloor,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewerIsBetter => write!(f, "newer-is-better"),
            Self::StrictNumericFloor => write!(f, "strict-numeric-floor"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    UpToDate,
    UpdateAvailable,
}

/// One update decision: the two values that were compared (after suffix
/// extraction), the outcome, and the policy that produced it. Never
/// persisted; produced once per orchestrated action.
#[derive(Debug, Clone)]
pub struct UpdateDecision {
    pub current: String,
    pub available: String,
    pub outcome: Outcome,
    pub policy: Policy,
}

impl UpdateDecision {
    #[must_use]
    pub fn update_available(&self) -> bool {
        self.outcome == Outcome::UpdateAvailable
    }
}

/// Reduce a full version string to the numeric suffix after its last `-`,
/// when one is present. `6.5.0-1` becomes `1`; `6.5.0` stays as-is.
#[must_use]
pub fn numeric_suffix(version: &str) -> &str {
    version
        .rsplit_once('-')
        .map_or(version, |(_, suffix)| suffix)
}

/// Decide whether an update is warranted.
///
/// Both sides are reduced with [`numeric_suffix`] first, and the reduced
/// values are what the returned decision reports for display.
#[must_use]
pub fn decide(local: &str, available: &str, policy: Policy) -> UpdateDecision {
    let current = numeric_suffix(local);
    let available = numeric_suffix(available);

    let outcome = match policy {
        Policy::NewerIsBetter => {
            if latest_of(current, available) == available && current != available {
                Outcome::UpdateAvailable
            } else {
                Outcome::UpToDate
            }
        }
        Policy::StrictNumericFloor => {
            if coerce_int(available) < coerce_int(current) {
                Outcome::UpToDate
            } else {
                Outcome::UpdateAvailable
            }
        }
    };

    debug!("decision under {policy}: current={current} available={available} -> {outcome:?}");

    UpdateDecision {
        current: current.to_string(),
        available: available.to_string(),
        outcome,
        policy,
    }
}
