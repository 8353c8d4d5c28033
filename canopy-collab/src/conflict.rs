//! Version history and conflict tracking for field-level edits.
//!
//! The resolver keeps an append-only log of local mutation sets
//! ([`VersionEntry`]) on top of a base snapshot, plus the working set of
//! open conflicts between local and remote edits. It never applies a
//! resolution to application data; callers do that with the returned
//! [`ResolvedConflict`].
//!
//! ```text
//!   base snapshot ─► v(n+1) ─► v(n+2) ─► ... ─► v(head)
//!   (compacted)       └──── retained, bounded by max_versions ───┘
//! ```
//!
//! Synchronous and I/O free.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::protocol::CurrentUser;

/// Opaque version identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(Uuid);

impl VersionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque conflict identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConflictId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value of one field before and after a change. `None` means absent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

impl FieldChange {
    pub fn new(before: Option<Value>, after: Option<Value>) -> Self {
        Self { before, after }
    }

    /// Field set where it was absent.
    pub fn set(after: Value) -> Self {
        Self { before: None, after: Some(after) }
    }

    pub fn update(before: Value, after: Value) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
        }
    }

    /// Field removed.
    pub fn remove(before: Value) -> Self {
        Self { before: Some(before), after: None }
    }

    fn inverted(self) -> Self {
        Self {
            before: self.after,
            after: self.before,
        }
    }
}

/// Field name → change, ordered by field name.
pub type ChangeSet = BTreeMap<String, FieldChange>;

/// Field name → value.
pub type Snapshot = BTreeMap<String, Value>;

/// One committed local mutation set. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub id: VersionId,
    /// 1-based, strictly increasing
    pub version: u64,
    pub user_id: String,
    pub user_name: String,
    pub changes: ChangeSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Input to [`ConflictResolver::add_conflict`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetails {
    pub field: String,
    pub local_value: Value,
    pub remote_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_value: Option<Value>,
    pub local_timestamp: DateTime<Utc>,
    pub remote_timestamp: DateTime<Utc>,
    pub remote_user_id: String,
}

/// An open conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub field: String,
    pub local_value: Value,
    pub remote_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_value: Option<Value>,
    pub local_timestamp: DateTime<Utc>,
    pub remote_timestamp: DateTime<Utc>,
    pub remote_user_id: String,
}

/// How a conflict was adjudicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy", content = "value")]
pub enum Resolution {
    /// Keep the local value
    Local,
    /// Take the remote value
    Remote,
    /// Caller-supplied merge result
    Merged(Value),
}

/// A conflict removed from the working set, with its adjudication.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    pub conflict: ConflictRecord,
    pub resolution: Resolution,
}

impl ResolvedConflict {
    /// The value the caller should write to the field.
    pub fn value(&self) -> &Value {
        match &self.resolution {
            Resolution::Local => &self.conflict.local_value,
            Resolution::Remote => &self.conflict.remote_value,
            Resolution::Merged(value) => value,
        }
    }
}

/// A field edit published by another participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEdit {
    pub field: String,
    /// Value the remote participant edited from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Classification of a [`RemoteEdit`] against local history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Local value equals the remote base; safe to apply
    Apply,
    /// Local value already equals the remote value
    Duplicate,
    /// Local diverged from the remote base; conflict recorded
    Conflict(ConflictId),
}

/// Resolver configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverConfig {
    /// Retained versions before the oldest are compacted (None = unbounded)
    pub max_versions: Option<usize>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_versions: Some(1000),
        }
    }
}

impl ResolverConfig {
    pub fn with_max_versions(mut self, max_versions: Option<usize>) -> Self {
        self.max_versions = max_versions;
        self
    }
}

/// Version history plus open conflicts for one session.
pub struct ConflictResolver {
    user: CurrentUser,
    config: ResolverConfig,
    /// State folded from compacted versions
    base: Snapshot,
    /// Last version folded into `base` (0 = none)
    base_version: u64,
    versions: VecDeque<VersionEntry>,
    conflicts: Vec<ConflictRecord>,
    /// Remote values applied since the field's last local change
    remote_applied: BTreeMap<String, Option<Value>>,
    version_counter: u64,
}

impl ConflictResolver {
    pub fn new(user: CurrentUser, config: ResolverConfig) -> Self {
        Self {
            user,
            config,
            base: Snapshot::new(),
            base_version: 0,
            versions: VecDeque::new(),
            conflicts: Vec::new(),
            remote_applied: BTreeMap::new(),
            version_counter: 0,
        }
    }

    /// Append a version authored by the local user.
    pub fn record_version(&mut self, changes: ChangeSet, message: Option<String>) -> VersionId {
        self.version_counter += 1;
        let id = VersionId::new();
        for field in changes.keys() {
            self.remote_applied.remove(field);
        }
        log::debug!(
            "Recorded version {} ({} field(s))",
            self.version_counter,
            changes.len()
        );
        self.versions.push_back(VersionEntry {
            id,
            version: self.version_counter,
            user_id: self.user.id.clone(),
            user_name: self.user.name.clone(),
            changes,
            message,
            timestamp: Utc::now(),
        });
        self.compact();
        id
    }

    /// Fold versions beyond `max_versions` into the base snapshot.
    fn compact(&mut self) {
        let Some(max) = self.config.max_versions else {
            return;
        };
        let mut folded = 0;
        while self.versions.len() > max {
            let Some(entry) = self.versions.pop_front() else {
                break;
            };
            apply_changes(&mut self.base, &entry.changes);
            self.base_version = entry.version;
            folded += 1;
        }
        if folded > 0 {
            log::debug!("Compacted {folded} version(s) into base (now at v{})", self.base_version);
        }
    }

    /// Retained versions, oldest first.
    pub fn versions(&self) -> impl Iterator<Item = &VersionEntry> {
        self.versions.iter()
    }

    pub fn version(&self, id: VersionId) -> Option<&VersionEntry> {
        self.versions.iter().find(|v| v.id == id)
    }

    pub fn latest_version(&self) -> Option<&VersionEntry> {
        self.versions.back()
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Highest version number issued.
    pub fn version_counter(&self) -> u64 {
        self.version_counter
    }

    /// Version number folded into the base snapshot (0 = none).
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    fn position(&self, id: VersionId) -> Option<usize> {
        self.versions.iter().position(|v| v.id == id)
    }

    /// Field state as of `id`, inclusive.
    ///
    /// Fields untouched up to that version are absent. `None` if `id` is
    /// unknown or was compacted.
    pub fn revert_to_version(&self, id: VersionId) -> Option<Snapshot> {
        let target = self.position(id)?;
        let mut snapshot = self.base.clone();
        for entry in self.versions.iter().take(target + 1) {
            apply_changes(&mut snapshot, &entry.changes);
        }
        Some(snapshot)
    }

    /// Squashed change per field touched after `from` up to and including `to`.
    ///
    /// When `to` precedes `from` the inverse diff is returned. Same id
    /// yields an empty set; unknown or compacted ids yield `None`.
    pub fn compare_versions(&self, from: VersionId, to: VersionId) -> Option<ChangeSet> {
        let a = self.position(from)?;
        let b = self.position(to)?;
        if a <= b {
            Some(self.squash(a + 1, b))
        } else {
            Some(
                self.squash(b + 1, a)
                    .into_iter()
                    .map(|(field, change)| (field, change.inverted()))
                    .collect(),
            )
        }
    }

    /// Squash retained versions `start..=end` into one change set.
    fn squash(&self, start: usize, end: usize) -> ChangeSet {
        let mut squashed = ChangeSet::new();
        for entry in self.versions.iter().skip(start).take((end + 1).saturating_sub(start)) {
            for (field, change) in &entry.changes {
                squashed
                    .entry(field.clone())
                    .and_modify(|c| c.after = change.after.clone())
                    .or_insert_with(|| change.clone());
            }
        }
        squashed
    }

    /// Current local value of `field`: the latest applied remote value or
    /// local change, falling back to the base snapshot.
    pub fn current_value(&self, field: &str) -> Option<Value> {
        if let Some(applied) = self.remote_applied.get(field) {
            return applied.clone();
        }
        self.versions
            .iter()
            .rev()
            .find_map(|entry| entry.changes.get(field))
            .map_or_else(|| self.base.get(field).cloned(), |change| change.after.clone())
    }

    fn last_local_change(&self, field: &str) -> Option<DateTime<Utc>> {
        self.versions
            .iter()
            .rev()
            .find(|entry| entry.changes.contains_key(field))
            .map(|entry| entry.timestamp)
    }

    /// Classify a remote edit against local state.
    ///
    /// `Apply` also records the remote value as the field's current value.
    pub fn reconcile_remote(&mut self, edit: &RemoteEdit) -> Reconciliation {
        let local = self.current_value(&edit.field);
        if local == edit.after {
            return Reconciliation::Duplicate;
        }
        if local == edit.before {
            self.remote_applied.insert(edit.field.clone(), edit.after.clone());
            return Reconciliation::Apply;
        }

        let id = self.add_conflict(ConflictDetails {
            field: edit.field.clone(),
            local_value: local.unwrap_or(Value::Null),
            remote_value: edit.after.clone().unwrap_or(Value::Null),
            base_value: edit.before.clone(),
            local_timestamp: self.last_local_change(&edit.field).unwrap_or_else(Utc::now),
            remote_timestamp: edit.timestamp,
            remote_user_id: edit.user_id.clone(),
        });
        Reconciliation::Conflict(id)
    }

    // ── Conflicts ──────────────────────────────────────────────────

    pub fn add_conflict(&mut self, details: ConflictDetails) -> ConflictId {
        let id = ConflictId::new();
        log::info!(
            "Conflict on field '{}' with {} ({id})",
            details.field,
            details.remote_user_id
        );
        self.conflicts.push(ConflictRecord {
            id,
            field: details.field,
            local_value: details.local_value,
            remote_value: details.remote_value,
            base_value: details.base_value,
            local_timestamp: details.local_timestamp,
            remote_timestamp: details.remote_timestamp,
            remote_user_id: details.remote_user_id,
        });
        id
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Open conflicts in detection order.
    pub fn conflicts(&self) -> &[ConflictRecord] {
        &self.conflicts
    }

    pub fn conflict(&self, id: ConflictId) -> Option<&ConflictRecord> {
        self.conflicts.iter().find(|c| c.id == id)
    }

    /// Remove one conflict. `None` if it is not open.
    pub fn resolve_conflict(
        &mut self,
        id: ConflictId,
        resolution: Resolution,
    ) -> Option<ResolvedConflict> {
        let index = self.conflicts.iter().position(|c| c.id == id)?;
        let conflict = self.conflicts.remove(index);
        log::debug!("Resolved conflict {id} on '{}'", conflict.field);
        Some(ResolvedConflict { conflict, resolution })
    }

    /// Remove every open conflict with the same resolution.
    pub fn resolve_all_conflicts(&mut self, resolution: Resolution) -> Vec<ResolvedConflict> {
        self.conflicts
            .drain(..)
            .map(|conflict| ResolvedConflict {
                conflict,
                resolution: resolution.clone(),
            })
            .collect()
    }

    /// Reset versions, conflicts, the version counter and the base snapshot.
    pub fn clear_history(&mut self) {
        self.versions.clear();
        self.conflicts.clear();
        self.base.clear();
        self.remote_applied.clear();
        self.base_version = 0;
        self.version_counter = 0;
    }

    pub fn user(&self) -> &CurrentUser {
        &self.user
    }
}

fn apply_changes(snapshot: &mut Snapshot, changes: &ChangeSet) {
    for (field, change) in changes {
        match &change.after {
            Some(value) => {
                snapshot.insert(field.clone(), value.clone());
            }
            None => {
                snapshot.remove(field);
            }
        }
    }
}
