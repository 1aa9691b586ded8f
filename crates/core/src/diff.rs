//! Set reconciliation between a desired and an observed membership set.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Build a member set from any iterable of string-likes.
pub fn member_set<I, S>(items: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// How a desired set relates to members that are present but not desired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipMode {
    /// Only ensure desired members are present; never remove anyone.
    #[default]
    Add,
    /// Make the observed set exactly the desired set.
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown membership mode: {0}")]
pub struct UnknownModeError(pub String);

impl FromStr for MembershipMode {
    type Err = UnknownModeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("add") {
            Ok(Self::Add)
        } else if value.eq_ignore_ascii_case("overwrite") {
            Ok(Self::Overwrite)
        } else {
            Err(UnknownModeError(value.to_string()))
        }
    }
}

/// Pending additions and removals needed to turn an observed set into a
/// desired one.
///
/// Both sets are always present. An empty `to_remove` means "nothing to
/// remove", which is still a step the caller must confirm against the remote
/// system. A diff is computed once and never edited afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    to_add: HashSet<String>,
    to_remove: HashSet<String>,
}

impl DiffResult {
    /// Members that must be added.
    pub fn to_add(&self) -> &HashSet<String> {
        &self.to_add
    }

    /// Members that must be removed.
    pub fn to_remove(&self) -> &HashSet<String> {
        &self.to_remove
    }

    /// `to_add = desired \ actual`, `to_remove = actual \ desired`.
    pub fn compute(desired: &HashSet<String>, actual: &HashSet<String>) -> Self {
        Self {
            to_add: desired.difference(actual).cloned().collect(),
            to_remove: actual.difference(desired).cloned().collect(),
        }
    }

    /// Change between two desired snapshots (prior state and new plan).
    pub fn between(old: &HashSet<String>, new: &HashSet<String>) -> Self {
        Self::compute(new, old)
    }

    /// Diff honouring the membership mode: `Add` never removes.
    pub fn for_mode(mode: MembershipMode, desired: &HashSet<String>, actual: &HashSet<String>) -> Self {
        match mode {
            MembershipMode::Overwrite => Self::compute(desired, actual),
            MembershipMode::Add => Self {
                to_add: desired.difference(actual).cloned().collect(),
                to_remove: HashSet::new(),
            },
        }
    }

    /// Removal of every listed member.
    pub fn remove_all(members: &HashSet<String>) -> Self {
        Self {
            to_add: HashSet::new(),
            to_remove: members.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Every pending add is present and every pending remove is gone.
    pub fn is_reflected_in(&self, actual: &HashSet<String>) -> bool {
        self.to_add.is_subset(actual) && self.to_remove.is_disjoint(actual)
    }

    /// What of this diff the observed set does not reflect yet.
    pub fn unsettled(&self, actual: &HashSet<String>) -> DiffResult {
        Self {
            to_add: self.to_add.difference(actual).cloned().collect(),
            to_remove: self.to_remove.intersection(actual).cloned().collect(),
        }
    }
}

impl fmt::Display for DiffResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "to add [{}], to remove [{}]",
            sorted(&self.to_add).join(", "),
            sorted(&self.to_remove).join(", ")
        )
    }
}

fn sorted(set: &HashSet<String>) -> Vec<&str> {
    let mut items: Vec<&str> = set.iter().map(String::as_str).collect();
    items.sort_unstable();
    items
}
