use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A patch-level version: the original string plus its dot-separated
/// components, parsed once and immutable afterwards.
///
/// Components are not restricted to digits; ESXi build tokens such as
/// `5b` or `U3` appear in the wild and are ordered by the ordinal value
/// of their first character (see [`compare`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    raw: String,
    components: Vec<String>,
}

impl Version {
    /// Parsing never fails: any string splits into components.
    #[must_use]
    pub fn new(s: &str) -> Self {
        let raw = s.trim().to_string();
        let components = raw.split('.').map(str::to_string).collect();
        Self { raw, components }
    }

    #[must_use]
    pub fn components(&self) -> &[String] {
        &self.components
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Synthetic sortable key: one integer per component.
    ///
    /// A component containing an ASCII letter contributes the ordinal
    /// value of its first character; any other component contributes its
    /// leading decimal digits. A component that is neither letter-bearing
    /// nor digit-led coerces to 0. That fallback is inherited behavior
    /// and is load-bearing for compatibility; see DESIGN.md before
    /// changing it.
    fn sort_key(&self) -> Vec<u64> {
        self.components
            .iter()
            .map(|component| {
                if component.chars().any(|ch| ch.is_ascii_alphabetic()) {
                    component.chars().next().map_or(0, |ch| u64::from(ch as u32))
                } else {
                    coerce_int(component)
                }
            })
            .collect()
    }
}

impl FromStr for Version {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Relative order of two versions, named from `a`'s point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    ANewer,
    BNewer,
    Equal,
}

/// Compare two versions by their synthetic sort keys, component-wise.
///
/// Keys of differing length compare element-wise; when one side runs out
/// while still equal, the shorter side orders first. Pure: same inputs
/// always yield the same outcome.
#[must_use]
pub fn compare(a: &Version, b: &Version) -> Comparison {
    match a.sort_key().cmp(&b.sort_key()) {
        Ordering::Greater => Comparison::ANewer,
        Ordering::Less => Comparison::BNewer,
        Ordering::Equal => Comparison::Equal,
    }
}

/// Return whichever of the two original strings denotes the newest
/// version. Ties return `current`, preserving its display formatting.
#[must_use]
pub fn latest_of<'a>(current: &'a str, available: &'a str) -> &'a str {
    match compare(&Version::new(current), &Version::new(available)) {
        Comparison::BNewer => available,
        Comparison::ANewer | Comparison::Equal => current,
    }
}

/// Leading-digits integer coercion: `"20a"` is 20, `"abc"` and `""` are 0.
pub(crate) fn coerce_int(s: &str) -> u64 {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}
