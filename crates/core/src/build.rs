//! IDE build numbers and version-gated workarounds.
//!
//! The upstream reports its build as a dotted string such as `261.20247.10`
//! or `261.SNAPSHOT`. A handful of upstream defects are compensated for by
//! the proxy until the build that fixes them; `WorkaroundSet` decides which
//! compensations are active for a connected upstream.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// One dotted component of a build number.
///
/// Variant order matters: the derived `Ord` makes `Snapshot` greater than
/// any `Num`, which is exactly the sentinel rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Component {
    Num(u32),
    Snapshot,
}

/// A dotted IDE build number.
#[derive(Debug, Clone)]
pub struct BuildNumber {
    components: Vec<Component>,
}

impl BuildNumber {
    pub fn new(components: Vec<Component>) -> Self {
        Self { components }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }
}

impl fmt::Display for BuildNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            match c {
                Component::Num(n) => write!(f, "{}", n)?,
                Component::Snapshot => write!(f, "SNAPSHOT")?,
            }
        }
        Ok(())
    }
}

/// Error parsing a build number string.
#[derive(Debug, thiserror::Error)]
#[error("invalid build number component '{component}' in '{input}'")]
pub struct ParseBuildNumberError {
    pub input: String,
    pub component: String,
}

impl FromStr for BuildNumber {
    type Err = ParseBuildNumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut components = Vec::new();
        for token in s.split('.') {
            if token == "SNAPSHOT" {
                components.push(Component::Snapshot);
            } else {
                let n = token.parse::<u32>().map_err(|_| ParseBuildNumberError {
                    input: s.to_string(),
                    component: token.to_string(),
                })?;
                components.push(Component::Num(n));
            }
        }
        Ok(Self { components })
    }
}

// Comparison pads the shorter side with zeros, so `261.20247.10` is not
// earlier than `261.20247`. Equality is defined through the same padded
// comparison to keep Eq and Ord consistent.
impl Ord for BuildNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(Component::Num(0));
            let b = other.components.get(i).copied().unwrap_or(Component::Num(0));
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for BuildNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for BuildNumber {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BuildNumber {}

/// Known upstream defects the proxy compensates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Workaround {
    /// Catalog entries arrive without `inputSchema`; the proxy substitutes a
    /// permissive empty-object schema while merging.
    ListToolsMissingInputSchema,
    /// Tool failures arrive without the `isError` flag; the proxy infers it
    /// from an `Error:` text prefix.
    CallResultMissingIsError,
}

impl Workaround {
    pub const ALL: [Workaround; 2] = [
        Workaround::ListToolsMissingInputSchema,
        Workaround::CallResultMissingIsError,
    ];

    /// The first upstream build that no longer needs this workaround.
    pub fn fixed_in(self) -> BuildNumber {
        use Component::Num;
        match self {
            Workaround::ListToolsMissingInputSchema => {
                BuildNumber::new(vec![Num(251), Num(23774)])
            }
            Workaround::CallResultMissingIsError => BuildNumber::new(vec![Num(252), Num(21735)]),
        }
    }
}

/// The set of workarounds active for one upstream session.
///
/// Computed once per handshake from the reported build and carried on the
/// session, so concurrent calls read an immutable value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkaroundSet {
    active: HashSet<Workaround>,
}

impl WorkaroundSet {
    /// No workarounds. Also the right answer for an unknown upstream
    /// version: assume fixed/default behavior.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn for_build(build: &BuildNumber) -> Self {
        let active = Workaround::ALL
            .into_iter()
            .filter(|w| *build < w.fixed_in())
            .collect();
        Self { active }
    }

    /// Evaluate from the raw version string the upstream handshake reported.
    /// `None` or an unparseable string disables every workaround.
    pub fn for_version(version: Option<&str>) -> Self {
        match version {
            Some(v) => match v.parse::<BuildNumber>() {
                Ok(build) => Self::for_build(&build),
                Err(err) => {
                    tracing::warn!(version = v, %err, "unparseable upstream version, disabling workarounds");
                    Self::none()
                }
            },
            None => Self::none(),
        }
    }

    pub fn applies(&self, workaround: Workaround) -> bool {
        self.active.contains(&workaround)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
