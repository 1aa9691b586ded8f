//! Group membership reconciliation.
//!
//! Applies a membership diff one idempotent add/remove at a time, then polls
//! the group until the diff is visible in enough consecutive reads.
//!
//! Two reconciliations racing on the same group are not coordinated: each
//! computes its diff from its own snapshot and the last writer wins. Callers
//! that need ordering must serialize invocations per group themselves.

use log::{debug, info};
use std::collections::HashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::classify::ErrorClassifier;
use crate::config::{MembershipConfig, RetryPolicy};
use crate::diff::{DiffResult, MembershipMode};
use crate::error::RemoteError;
use crate::lifecycle::Operation;
use crate::poll::{ConvergenceError, Poller};
use crate::retry::{execute_classified, RetryError};
use crate::transport::MembershipClient;

/// Membership state tracked for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    /// Opaque identity of the membership binding.
    pub id: String,
    pub group: String,
    pub mode: MembershipMode,
    pub members: HashSet<String>,
}

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("{operation} memberships of group [{group}]: {source}")]
    Remote {
        operation: Operation,
        group: String,
        #[source]
        source: RetryError<RemoteError>,
    },

    /// One add/remove failed. `applied` counts the calls that went through
    /// before it.
    #[error("{operation} memberships of group [{group}]: member {member}: {source}")]
    Member {
        operation: Operation,
        group: String,
        member: String,
        applied: usize,
        #[source]
        source: RetryError<RemoteError>,
    },

    #[error("{operation} memberships of group [{group}] was applied but did not converge: {source}")]
    NotConverged {
        operation: Operation,
        group: String,
        #[source]
        source: ConvergenceError<RetryError<RemoteError>>,
    },

    #[error("{operation} memberships of group [{group}] was applied but could not be confirmed: {source}")]
    Applied {
        operation: Operation,
        group: String,
        #[source]
        source: RetryError<RemoteError>,
    },

    #[error("{operation} memberships of group [{group}] was applied but the group no longer exists")]
    Vanished { operation: Operation, group: String },
}

impl MembershipError {
    pub fn group(&self) -> &str {
        match self {
            Self::Remote { group, .. }
            | Self::Member { group, .. }
            | Self::NotConverged { group, .. }
            | Self::Applied { group, .. }
            | Self::Vanished { group, .. } => group,
        }
    }

    /// True when some change already reached the group.
    pub fn is_partial(&self) -> bool {
        match self {
            Self::Member { applied, .. } => *applied > 0,
            Self::NotConverged { .. } | Self::Applied { .. } | Self::Vanished { .. } => true,
            Self::Remote { .. } => false,
        }
    }
}

pub struct MembershipReconciler<C> {
    client: C,
    config: MembershipConfig,
    call_classifier: ErrorClassifier,
}

impl<C: MembershipClient> MembershipReconciler<C> {
    pub fn new(client: C, config: MembershipConfig) -> Self {
        Self {
            client,
            config,
            call_classifier: ErrorClassifier::transient_http().merge(ErrorClassifier::dependency_pending()),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Bring `group` to the desired membership. `Overwrite` removes members
    /// that are not desired; `Add` leaves them alone.
    pub async fn create(
        &self,
        group: &str,
        mode: MembershipMode,
        desired: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<GroupMembership, MembershipError> {
        let actual = match mode {
            MembershipMode::Overwrite => self
                .list(group, cancel)
                .await
                .map_err(|source| remote_error(Operation::Create, group, source))?,
            MembershipMode::Add => HashSet::new(),
        };
        let diff = DiffResult::for_mode(mode, desired, &actual);

        self.apply(Operation::Create, group, &diff, cancel).await?;
        self.settle(Operation::Create, group, &diff, self.config.create, cancel)
            .await?;

        let members = self
            .confirm(Operation::Create, group, mode, desired, cancel)
            .await?;
        let id = Uuid::new_v4().to_string();
        info!(
            "Memberships of group [{}] created ({} members, id {})",
            group,
            members.len(),
            id
        );
        Ok(GroupMembership {
            id,
            group: group.to_string(),
            mode,
            members,
        })
    }

    /// Current members as tracked by `mode`, or `None` when the group is gone.
    pub async fn read(
        &self,
        group: &str,
        mode: MembershipMode,
        tracked: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<HashSet<String>>, MembershipError> {
        self.observe(group, mode, tracked, cancel)
            .await
            .map_err(|source| remote_error(Operation::Read, group, source))
    }

    /// Move from the tracked membership to `desired`.
    pub async fn update(
        &self,
        current: &GroupMembership,
        desired: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<GroupMembership, MembershipError> {
        let group = current.group.as_str();
        let diff = DiffResult::between(&current.members, desired);
        if diff.is_empty() {
            debug!("Memberships of group [{}] unchanged", group);
            return Ok(current.clone());
        }

        self.apply(Operation::Update, group, &diff, cancel).await?;
        self.settle(Operation::Update, group, &diff, self.config.update, cancel)
            .await?;

        let members = self
            .confirm(Operation::Update, group, current.mode, desired, cancel)
            .await?;
        Ok(GroupMembership {
            members,
            ..current.clone()
        })
    }

    /// Remove every tracked member and wait until none is visible.
    pub async fn delete(
        &self,
        current: &GroupMembership,
        cancel: &CancellationToken,
    ) -> Result<(), MembershipError> {
        let group = current.group.as_str();
        let diff = DiffResult::remove_all(&current.members);

        self.apply(Operation::Delete, group, &diff, cancel).await?;
        self.settle(Operation::Delete, group, &diff, self.config.delete, cancel)
            .await?;
        info!("Memberships of group [{}] deleted", group);
        Ok(())
    }

    async fn list(
        &self,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<HashSet<String>, RetryError<RemoteError>> {
        execute_classified(
            || self.client.list_members(group),
            &self.call_classifier,
            &self.config.call,
            cancel,
        )
        .await
    }

    /// Removals first, then additions. Stops at the first failure.
    async fn apply(
        &self,
        operation: Operation,
        group: &str,
        diff: &DiffResult,
        cancel: &CancellationToken,
    ) -> Result<(), MembershipError> {
        let mut applied = 0;
        for member in sorted(diff.to_remove()) {
            debug!("Removing {} from group [{}]", member, group);
            execute_classified(
                || self.client.remove_member(group, member),
                &self.call_classifier,
                &self.config.call,
                cancel,
            )
            .await
            .map_err(|source| member_error(operation, group, member, applied, source))?;
            applied += 1;
        }

        for member in sorted(diff.to_add()) {
            debug!("Adding {} to group [{}]", member, group);
            execute_classified(
                || self.client.add_member(group, member),
                &self.call_classifier,
                &self.config.call,
                cancel,
            )
            .await
            .map_err(|source| member_error(operation, group, member, applied, source))?;
            applied += 1;
        }
        Ok(())
    }

    async fn settle(
        &self,
        operation: Operation,
        group: &str,
        diff: &DiffResult,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), MembershipError> {
        let poller = Poller::new(
            policy,
            format!("membership {}", operation),
            format!("group [{}]", group),
        );
        poller
            .wait_for_reflection(|| self.list(group, cancel), diff, cancel)
            .await
            .map_err(|source| MembershipError::NotConverged {
                operation,
                group: group.to_string(),
                source,
            })?;
        Ok(())
    }

    /// Trailing read after the changes settled. Anything short of a member
    /// list is partial.
    async fn confirm(
        &self,
        operation: Operation,
        group: &str,
        mode: MembershipMode,
        tracked: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<HashSet<String>, MembershipError> {
        match self.observe(group, mode, tracked, cancel).await {
            Ok(Some(members)) => Ok(members),
            Ok(None) => Err(MembershipError::Vanished {
                operation,
                group: group.to_string(),
            }),
            Err(source) => Err(MembershipError::Applied {
                operation,
                group: group.to_string(),
                source,
            }),
        }
    }

    async fn observe(
        &self,
        group: &str,
        mode: MembershipMode,
        tracked: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<HashSet<String>>, RetryError<RemoteError>> {
        let actual = match self.list(group, cancel).await {
            Ok(actual) => actual,
            Err(err) if group_missing(&err) => {
                info!("Group [{}] not found, memberships absent", group);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let members = match mode {
            MembershipMode::Overwrite => actual,
            MembershipMode::Add => actual.intersection(tracked).cloned().collect(),
        };
        Ok(Some(members))
    }
}

/// The group itself is gone; cancellation never counts as absence.
fn group_missing(err: &RetryError<RemoteError>) -> bool {
    !matches!(err, RetryError::Cancelled { .. })
        && err.last_error().map(RemoteError::is_not_found).unwrap_or(false)
}

fn sorted(set: &HashSet<String>) -> Vec<&str> {
    let mut members: Vec<&str> = set.iter().map(String::as_str).collect();
    members.sort_unstable();
    members
}

fn remote_error(operation: Operation, group: &str, source: RetryError<RemoteError>) -> MembershipError {
    MembershipError::Remote {
        operation,
        group: group.to_string(),
        source,
    }
}

fn member_error(
    operation: Operation,
    group: &str,
    member: &str,
    applied: usize,
    source: RetryError<RemoteError>,
) -> MembershipError {
    MembershipError::Member {
        operation,
        group: group.to_string(),
        member: member.to_string(),
        applied,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::member_set;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Group {
        committed: HashSet<String>,
        visible: HashSet<String>,
        stale_reads_left: u32,
    }

    /// Graph fake whose reads lag writes by `lag` list calls.
    #[derive(Default)]
    struct FakeGraph {
        groups: Mutex<HashMap<String, Group>>,
        lag: u32,
        frozen: bool,
        forbidden_member: Option<String>,
        writes: Mutex<Vec<String>>,
        /// Add calls answered with 503 before the service recovers.
        unavailable_adds: Mutex<u32>,
        add_attempts: Mutex<u32>,
        /// Healthy list calls, after which every list fails with the error.
        list_outage: Option<(u32, RemoteError)>,
        lists: Mutex<u32>,
    }

    impl FakeGraph {
        fn with_group(group: &str, members: &[&str]) -> Self {
            let fake = Self::default();
            let set = member_set(members.iter().copied());
            fake.groups.lock().expect("lock").insert(
                group.to_string(),
                Group {
                    committed: set.clone(),
                    visible: set,
                    stale_reads_left: 0,
                },
            );
            fake
        }

        fn committed(&self, group: &str) -> HashSet<String> {
            self.groups.lock().expect("lock")[group].committed.clone()
        }

        fn writes(&self) -> Vec<String> {
            self.writes.lock().expect("lock").clone()
        }

        fn write(&self, group: &str, member: &str, add: bool) -> Result<()> {
            if self.forbidden_member.as_deref() == Some(member) {
                return Err(RemoteError::api(403, "TF50309: insufficient permissions"));
            }
            let mut groups = self.groups.lock().expect("lock");
            let entry = groups
                .get_mut(group)
                .ok_or_else(|| RemoteError::not_found("group not found"))?;
            if add {
                entry.committed.insert(member.to_string());
            } else {
                entry.committed.remove(member);
            }
            entry.stale_reads_left = self.lag;
            self.writes
                .lock()
                .expect("lock")
                .push(format!("{}{}", if add { "+" } else { "-" }, member));
            Ok(())
        }
    }

    #[async_trait]
    impl MembershipClient for FakeGraph {
        async fn list_members(&self, group: &str) -> Result<HashSet<String>> {
            {
                let mut lists = self.lists.lock().expect("lock");
                *lists += 1;
                if let Some((healthy, err)) = &self.list_outage {
                    if *lists > *healthy {
                        return Err(err.clone());
                    }
                }
            }
            let mut groups = self.groups.lock().expect("lock");
            let entry = groups
                .get_mut(group)
                .ok_or_else(|| RemoteError::not_found("VS860015: group not found"))?;
            if self.frozen {
                return Ok(entry.visible.clone());
            }
            if entry.stale_reads_left > 0 {
                entry.stale_reads_left -= 1;
            } else {
                entry.visible = entry.committed.clone();
            }
            Ok(entry.visible.clone())
        }

        async fn add_member(&self, group: &str, member: &str) -> Result<()> {
            *self.add_attempts.lock().expect("lock") += 1;
            {
                let mut unavailable = self.unavailable_adds.lock().expect("lock");
                if *unavailable > 0 {
                    *unavailable -= 1;
                    return Err(RemoteError::api(503, "TF246017: service unavailable"));
                }
            }
            self.write(group, member, true)
        }

        async fn remove_member(&self, group: &str, member: &str) -> Result<()> {
            self.write(group, member, false)
        }
    }

    fn quick_config() -> MembershipConfig {
        let wait = RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(1))
            .with_required_successes(2);
        MembershipConfig {
            call: RetryPolicy::new(Duration::from_secs(5), Duration::from_millis(100)),
            create: wait,
            update: wait,
            delete: wait,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_create_converges_to_desired_set() {
        let graph = FakeGraph {
            lag: 2,
            ..FakeGraph::with_group("g1", &["B", "C"])
        };
        let reconciler = MembershipReconciler::new(graph, MembershipConfig::default());

        let state = reconciler
            .create(
                "g1",
                MembershipMode::Overwrite,
                &member_set(["A", "B"]),
                &CancellationToken::new(),
            )
            .await
            .expect("converges");

        assert_eq!(state.members, member_set(["A", "B"]));
        assert_eq!(state.mode, MembershipMode::Overwrite);
        assert!(Uuid::parse_str(&state.id).is_ok());
        assert_eq!(reconciler.client().writes(), vec!["-C", "+A"]);
        assert_eq!(reconciler.client().committed("g1"), member_set(["A", "B"]));
    }

    #[tokio::test(start_paused = true)]
    async fn add_mode_keeps_unmanaged_members() {
        let graph = FakeGraph::with_group("g1", &["X"]);
        let reconciler = MembershipReconciler::new(graph, quick_config());

        let state = reconciler
            .create(
                "g1",
                MembershipMode::Add,
                &member_set(["A"]),
                &CancellationToken::new(),
            )
            .await
            .expect("converges");

        assert_eq!(state.members, member_set(["A"]));
        assert_eq!(reconciler.client().committed("g1"), member_set(["A", "X"]));
    }

    #[tokio::test(start_paused = true)]
    async fn update_applies_only_the_change() {
        let graph = FakeGraph {
            lag: 1,
            ..FakeGraph::with_group("g1", &["A", "B"])
        };
        let reconciler = MembershipReconciler::new(graph, quick_config());
        let current = GroupMembership {
            id: "m-1".to_string(),
            group: "g1".to_string(),
            mode: MembershipMode::Add,
            members: member_set(["A", "B"]),
        };

        let updated = reconciler
            .update(&current, &member_set(["B", "C"]), &CancellationToken::new())
            .await
            .expect("converges");

        assert_eq!(updated.id, "m-1");
        assert_eq!(updated.members, member_set(["B", "C"]));
        assert_eq!(reconciler.client().writes(), vec!["-A", "+C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_tracked_members_only() {
        let graph = FakeGraph::with_group("g1", &["A", "B", "Z"]);
        let reconciler = MembershipReconciler::new(graph, quick_config());
        let current = GroupMembership {
            id: "m-2".to_string(),
            group: "g1".to_string(),
            mode: MembershipMode::Add,
            members: member_set(["A", "B"]),
        };

        reconciler
            .delete(&current, &CancellationToken::new())
            .await
            .expect("removes");

        assert_eq!(reconciler.client().committed("g1"), member_set(["Z"]));
    }

    #[tokio::test(start_paused = true)]
    async fn read_of_missing_group_is_absent() {
        let reconciler = MembershipReconciler::new(FakeGraph::default(), quick_config());

        let members = reconciler
            .read(
                "missing",
                MembershipMode::Add,
                &member_set(["A"]),
                &CancellationToken::new(),
            )
            .await
            .expect("not found is not an error");

        assert_eq!(members, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_add_names_group_and_member() {
        let graph = FakeGraph {
            forbidden_member: Some("A".to_string()),
            ..FakeGraph::with_group("g1", &[])
        };
        let reconciler = MembershipReconciler::new(graph, quick_config());

        let err = reconciler
            .create(
                "g1",
                MembershipMode::Add,
                &member_set(["A"]),
                &CancellationToken::new(),
            )
            .await
            .expect_err("permission denied is fatal");

        assert!(!err.is_partial());
        assert_eq!(err.group(), "g1");
        assert_eq!(
            err.to_string(),
            "create memberships of group [g1]: member A: API error (403): TF50309: insufficient permissions"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_reads_past_timeout_are_partial_failures() {
        let graph = FakeGraph {
            frozen: true,
            ..FakeGraph::with_group("g1", &["B"])
        };
        let reconciler = MembershipReconciler::new(graph, quick_config());

        let err = reconciler
            .create(
                "g1",
                MembershipMode::Overwrite,
                &member_set(["A"]),
                &CancellationToken::new(),
            )
            .await
            .expect_err("never converges");

        assert!(err.is_partial());
        let message = err.to_string();
        assert!(message.contains("group [g1]"));
        assert!(message.contains("to add [A], to remove [B]"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_add_failure_is_retried() {
        let graph = FakeGraph {
            unavailable_adds: Mutex::new(1),
            ..FakeGraph::with_group("g1", &[])
        };
        let reconciler = MembershipReconciler::new(graph, quick_config());

        let state = reconciler
            .create(
                "g1",
                MembershipMode::Add,
                &member_set(["A"]),
                &CancellationToken::new(),
            )
            .await
            .expect("converges after retry");

        assert_eq!(state.members, member_set(["A"]));
        assert_eq!(*reconciler.client().add_attempts.lock().expect("lock"), 2);
        assert_eq!(reconciler.client().writes(), vec!["+A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_earlier_changes_is_partial() {
        let graph = FakeGraph {
            forbidden_member: Some("A".to_string()),
            ..FakeGraph::with_group("g1", &["B"])
        };
        let reconciler = MembershipReconciler::new(graph, quick_config());

        let err = reconciler
            .create(
                "g1",
                MembershipMode::Overwrite,
                &member_set(["A"]),
                &CancellationToken::new(),
            )
            .await
            .expect_err("adding A is forbidden");

        assert!(err.is_partial());
        assert!(matches!(err, MembershipError::Member { applied: 1, .. }));
        assert_eq!(reconciler.client().writes(), vec!["-B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_read_back_after_create_is_partial() {
        // two polls settle the change, the trailing list fails
        let graph = FakeGraph {
            list_outage: Some((2, RemoteError::api(403, "TF50309: insufficient permissions"))),
            ..FakeGraph::with_group("g1", &[])
        };
        let reconciler = MembershipReconciler::new(graph, quick_config());

        let err = reconciler
            .create(
                "g1",
                MembershipMode::Add,
                &member_set(["A"]),
                &CancellationToken::new(),
            )
            .await
            .expect_err("read back is forbidden");

        assert!(err.is_partial());
        assert!(matches!(err, MembershipError::Applied { .. }));
        assert_eq!(
            err.to_string(),
            "create memberships of group [g1] was applied but could not be confirmed: API error (403): TF50309: insufficient permissions"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn group_vanishing_after_update_is_partial() {
        let graph = FakeGraph {
            list_outage: Some((2, RemoteError::not_found("VS860015: group not found"))),
            ..FakeGraph::with_group("g1", &["A"])
        };
        let reconciler = MembershipReconciler::new(graph, quick_config());
        let current = GroupMembership {
            id: "m-3".to_string(),
            group: "g1".to_string(),
            mode: MembershipMode::Add,
            members: member_set(["A"]),
        };

        let err = reconciler
            .update(&current, &member_set(["A", "B"]), &CancellationToken::new())
            .await
            .expect_err("group is gone");

        assert!(err.is_partial());
        assert!(matches!(
            err,
            MembershipError::Vanished {
                operation: Operation::Update,
                ..
            }
        ));
    }
}
