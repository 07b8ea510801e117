// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared types for the permission migration engine.
//!
//! This crate contains the data model passed between the object lister, the
//! permission migrator, the per-identity orchestrator and the write-back
//! queue. It performs no I/O.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// ============================================================================
// Type Aliases
// ============================================================================

/// Remote object identifier
pub type ObjectId = String;

/// End-user identity (an email address on the storage service)
pub type Identity = String;

/// Old identity -> new identity lookup driving which permissions are rewritten.
///
/// Built once per run from the tracking store and shared read-only by every
/// worker.
pub type IdentityMapping = HashMap<Identity, Identity>;

/// MIME type the storage service uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

// ============================================================================
// Remote Objects
// ============================================================================

/// The kind of principal a permission entry names.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PrincipalType {
    User,
    Group,
    Domain,
    Anyone,
    /// Anything the service reports that we do not model
    #[serde(other)]
    Unknown,
}

/// A single sharing permission on a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Role granted (e.g. "owner", "writer", "reader", "commenter")
    pub role: String,
    /// What kind of principal the permission names
    pub principal_type: PrincipalType,
    /// The principal's identity; absent for domain and anyone grants
    pub principal: Option<Identity>,
}

impl Permission {
    pub fn is_owner(&self) -> bool {
        self.role == "owner"
    }
}

/// Whether an object is a container (folder) or a leaf (file).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Container,
    #[default]
    Leaf,
}

impl ObjectKind {
    /// Classify an object from the MIME type reported by the service.
    pub fn from_mime_type(mime_type: Option<&str>) -> Self {
        match mime_type {
            Some(FOLDER_MIME_TYPE) => ObjectKind::Container,
            _ => ObjectKind::Leaf,
        }
    }

    /// Label written to the detail sheet.
    pub fn label(self) -> &'static str {
        match self {
            ObjectKind::Container => "Folder",
            ObjectKind::Leaf => "File",
        }
    }
}

/// An object listed from the remote store for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub id: ObjectId,
    pub name: String,
    pub kind: ObjectKind,
    /// False when the service flags the object as unshareable by policy
    pub shareable: bool,
    /// Permission entries in the order the service returned them
    pub permissions: Vec<Permission>,
}

// ============================================================================
// Outcomes
// ============================================================================

/// Per-object migration status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Success,
    Error,
    Restricted,
    Skipped,
}

/// Human-readable access level derived from a permission role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum AccessLevel {
    View,
    Edit,
    Comment,
    Owner,
    Unknown,
}

impl AccessLevel {
    pub fn from_role(role: &str) -> Self {
        match role {
            "reader" | "viewer" => AccessLevel::View,
            "writer" => AccessLevel::Edit,
            "commenter" => AccessLevel::Comment,
            "owner" => AccessLevel::Owner,
            _ => AccessLevel::Unknown,
        }
    }
}

/// The result of migrating one remote object.
///
/// Exactly one is produced per listed object per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutcome {
    pub object_id: ObjectId,
    pub object_name: String,
    pub object_kind: ObjectKind,
    pub status: OutcomeStatus,
    /// Old identity of the last mapped permission acted on
    pub old_identity: Option<Identity>,
    /// New identity the last mapped permission was granted to
    pub new_identity: Option<Identity>,
    pub role: Option<String>,
    pub access_level: Option<AccessLevel>,
    pub permissions_added: u32,
    pub error_detail: Option<String>,
}

impl FileOutcome {
    /// Start an outcome for `object` with the given status.
    pub fn for_object(object: &RemoteObject, status: OutcomeStatus) -> Self {
        Self {
            object_id: object.id.clone(),
            object_name: object.name.clone(),
            object_kind: object.kind,
            status,
            old_identity: None,
            new_identity: None,
            role: None,
            access_level: None,
            permissions_added: 0,
            error_detail: None,
        }
    }

    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}

/// Aggregate counts for one identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub restricted: usize,
    pub skipped: usize,
}

impl MigrationStats {
    /// Count one outcome against its status bucket.
    pub fn record(&mut self, status: OutcomeStatus) {
        match status {
            OutcomeStatus::Success => self.success += 1,
            OutcomeStatus::Error => self.failed += 1,
            OutcomeStatus::Restricted => self.restricted += 1,
            OutcomeStatus::Skipped => self.skipped += 1,
        }
    }

    /// Number of outcomes counted so far across all buckets.
    pub fn accounted(&self) -> usize {
        self.success + self.failed + self.restricted + self.skipped
    }
}

/// Per-identity aggregate produced by one orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub identity: Identity,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// False only when the listing itself failed
    pub success: bool,
    pub error_message: Option<String>,
    pub stats: MigrationStats,
    /// Outcomes in completion order
    pub file_results: Vec<FileOutcome>,
    /// A stop left objects undispatched or aborted running tasks
    #[serde(default)]
    pub interrupted: bool,
}

impl MigrationResult {
    pub fn start(identity: impl Into<Identity>) -> Self {
        Self {
            identity: identity.into(),
            started_at: Utc::now(),
            finished_at: None,
            success: false,
            error_message: None,
            stats: MigrationStats::default(),
            file_results: Vec::new(),
            interrupted: false,
        }
    }

    /// Append an outcome and count it.
    pub fn push(&mut self, outcome: FileOutcome) {
        self.stats.record(outcome.status);
        self.file_results.push(outcome);
    }

    pub fn finish(&mut self, success: bool, error_message: Option<String>) {
        self.finished_at = Some(Utc::now());
        self.success = success;
        self.error_message = error_message;
    }

    /// Wall-clock duration of the run, if finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

/// Orchestrator state machine for one identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum MigrationPhase {
    #[default]
    NotStarted,
    Listing,
    FanOut,
    Aggregating,
    Done,
    Failed,
}

impl MigrationPhase {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: MigrationPhase) -> bool {
        use MigrationPhase::*;
        matches!(
            (self, next),
            (NotStarted, Listing)
                | (Listing, FanOut)
                | (Listing, Done)
                | (Listing, Failed)
                | (FanOut, Aggregating)
                | (Aggregating, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationPhase::Done | MigrationPhase::Failed)
    }
}

// ============================================================================
// Tracking Store Roster
// ============================================================================

/// Status of an identity as recorded in the tracking store roster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
    /// Free text an operator typed into the status column
    Other(String),
}

impl IdentityStatus {
    /// Identities in these states are picked up by a run.
    pub fn is_pending(&self) -> bool {
        matches!(self, IdentityStatus::NotStarted | IdentityStatus::InProgress)
    }
}

impl fmt::Display for IdentityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityStatus::NotStarted => f.write_str("Not Started"),
            IdentityStatus::InProgress => f.write_str("In Progress"),
            IdentityStatus::Completed => f.write_str("Completed"),
            IdentityStatus::Failed => f.write_str("Failed"),
            IdentityStatus::Other(s) => f.write_str(s),
        }
    }
}

impl FromStr for IdentityStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "" | "Not Started" => IdentityStatus::NotStarted,
            "In Progress" => IdentityStatus::InProgress,
            "Completed" => IdentityStatus::Completed,
            "Failed" => IdentityStatus::Failed,
            other => IdentityStatus::Other(other.to_string()),
        })
    }
}

/// One roster row: an identity to migrate and what was recorded for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub identity: Identity,
    /// 1-based row in the roster sheet
    pub row_index: u32,
    pub status: IdentityStatus,
    /// Counts recorded by a previous run, if any
    pub prior: MigrationStats,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn object(id: &str) -> RemoteObject {
        RemoteObject {
            id: id.to_string(),
            name: format!("{}.txt", id),
            kind: ObjectKind::Leaf,
            shareable: true,
            permissions: Vec::new(),
        }
    }

    #[test]
    fn outcome_status_string_forms() {
        assert_eq!(OutcomeStatus::Restricted.to_string(), "RESTRICTED");
        assert_eq!(
            "SKIPPED".parse::<OutcomeStatus>().unwrap(),
            OutcomeStatus::Skipped
        );
        assert_eq!(
            serde_json::to_string(&OutcomeStatus::Success).unwrap(),
            "\"SUCCESS\""
        );
    }

    #[test]
    fn principal_type_tolerates_unknown_values() {
        let p: PrincipalType = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(p, PrincipalType::User);
        let p: PrincipalType = serde_json::from_str("\"serviceAccount\"").unwrap();
        assert_eq!(p, PrincipalType::Unknown);
    }

    #[test]
    fn access_level_from_role() {
        assert_eq!(AccessLevel::from_role("reader"), AccessLevel::View);
        assert_eq!(AccessLevel::from_role("viewer"), AccessLevel::View);
        assert_eq!(AccessLevel::from_role("writer"), AccessLevel::Edit);
        assert_eq!(AccessLevel::from_role("commenter"), AccessLevel::Comment);
        assert_eq!(AccessLevel::from_role("owner"), AccessLevel::Owner);
        assert_eq!(AccessLevel::from_role("organizer"), AccessLevel::Unknown);
    }

    #[test]
    fn object_kind_from_mime_type() {
        assert_eq!(
            ObjectKind::from_mime_type(Some(FOLDER_MIME_TYPE)),
            ObjectKind::Container
        );
        assert_eq!(
            ObjectKind::from_mime_type(Some("text/plain")),
            ObjectKind::Leaf
        );
        assert_eq!(ObjectKind::from_mime_type(None), ObjectKind::Leaf);
        assert_eq!(ObjectKind::Container.label(), "Folder");
    }

    #[test]
    fn result_counts_track_pushed_outcomes() {
        let mut result = MigrationResult::start("alice@example.com");
        result.stats.total = 4;
        result.push(FileOutcome::for_object(&object("a"), OutcomeStatus::Success));
        result.push(FileOutcome::for_object(&object("b"), OutcomeStatus::Error));
        result.push(FileOutcome::for_object(&object("c"), OutcomeStatus::Restricted));
        result.push(FileOutcome::for_object(&object("d"), OutcomeStatus::Skipped));
        result.finish(true, None);

        assert_eq!(result.file_results.len(), 4);
        assert_eq!(result.stats.accounted(), result.stats.total);
        assert_eq!(result.stats.success, 1);
        assert_eq!(result.stats.failed, 1);
        assert_eq!(result.stats.restricted, 1);
        assert_eq!(result.stats.skipped, 1);
        assert!(result.duration().is_some());
    }

    #[test]
    fn phase_transitions() {
        use MigrationPhase::*;
        assert!(NotStarted.can_transition_to(Listing));
        assert!(Listing.can_transition_to(Done));
        assert!(Listing.can_transition_to(Failed));
        assert!(FanOut.can_transition_to(Aggregating));
        assert!(!NotStarted.can_transition_to(FanOut));
        assert!(!Done.can_transition_to(Listing));
        assert!(Failed.is_terminal());
        assert!(!Aggregating.is_terminal());
    }

    #[test]
    fn identity_status_round_trips_display() {
        for s in ["Not Started", "In Progress", "Completed", "Failed", "On hold"] {
            let status: IdentityStatus = s.parse().unwrap();
            assert_eq!(status.to_string(), s);
        }
        let empty: IdentityStatus = "  ".parse().unwrap();
        assert_eq!(empty, IdentityStatus::NotStarted);
        assert!(IdentityStatus::InProgress.is_pending());
        assert!(!IdentityStatus::Other("On hold".into()).is_pending());
    }
}
