// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Per-object permission rewrite

use std::sync::Arc;

use migration_types::{
    AccessLevel, FileOutcome, IdentityMapping, OutcomeStatus, Permission, PrincipalType,
    RemoteObject,
};
use tracing::{debug, warn};

use crate::drive::DriveClient;

const SHARING_RESTRICTED: &str = "File sharing is restricted";
const NO_PERMISSIONS: &str = "No permissions to process";
const NOTHING_TO_MIGRATE: &str = "No permissions to migrate";
const NOTHING_GRANTED: &str = "Failed to add any permissions";

/// The principal a permission may be migrated from, if it is eligible at all.
///
/// Owner grants, domain-wide and "anyone" grants, non-user principals and
/// entries without an address are never migrated.
pub fn migratable_principal(permission: &Permission) -> Option<&str> {
    if permission.is_owner() {
        return None;
    }
    match permission.principal_type {
        PrincipalType::User => permission
            .principal
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty()),
        PrincipalType::Domain
        | PrincipalType::Anyone
        | PrincipalType::Group
        | PrincipalType::Unknown => None,
    }
}

/// Rewrites one object's grants from old identities to their mapped
/// replacements.
pub struct PermissionMigrator {
    drive: Arc<DriveClient>,
}

impl PermissionMigrator {
    pub fn new(drive: Arc<DriveClient>) -> Self {
        Self { drive }
    }

    /// Migrate `object`, acting as `identity`, and classify the result.
    ///
    /// Never fails: every error is folded into the returned outcome.
    pub async fn migrate(
        &self,
        object: &RemoteObject,
        mapping: &IdentityMapping,
        identity: &str,
    ) -> FileOutcome {
        if !object.shareable {
            return FileOutcome::for_object(object, OutcomeStatus::Restricted)
                .with_error(SHARING_RESTRICTED);
        }

        if object.permissions.is_empty() {
            return FileOutcome::for_object(object, OutcomeStatus::Skipped)
                .with_error(NO_PERMISSIONS);
        }

        let mut outcome = FileOutcome::for_object(object, OutcomeStatus::Skipped);
        let mut attempted = false;
        let mut granted = false;

        for permission in &object.permissions {
            let Some(old_identity) = migratable_principal(permission) else {
                continue;
            };
            let Some(new_identity) = mapping.get(old_identity) else {
                continue;
            };

            attempted = true;
            outcome.old_identity = Some(old_identity.to_string());
            outcome.new_identity = Some(new_identity.clone());
            outcome.role = Some(permission.role.clone());
            outcome.access_level = Some(AccessLevel::from_role(&permission.role));

            match self
                .drive
                .add_permission(identity, &object.id, &permission.role, new_identity)
                .await
            {
                Ok(()) => {
                    granted = true;
                    outcome.status = OutcomeStatus::Success;
                    outcome.permissions_added += 1;
                    debug!(
                        identity = %identity,
                        object_id = %object.id,
                        old = %old_identity,
                        new = %new_identity,
                        role = %permission.role,
                        "Granted permission"
                    );
                }
                Err(e) => {
                    outcome.status = if e.is_restriction() {
                        OutcomeStatus::Restricted
                    } else {
                        OutcomeStatus::Error
                    };
                    outcome.error_detail = Some(e.to_string());
                    warn!(
                        identity = %identity,
                        object_id = %object.id,
                        old = %old_identity,
                        status = %outcome.status,
                        error = %e,
                        "Failed to grant permission"
                    );
                }
            }
        }

        if !attempted {
            outcome.status = OutcomeStatus::Skipped;
            outcome.error_detail = Some(NOTHING_TO_MIGRATE.to_string());
        } else if granted {
            outcome.status = OutcomeStatus::Success;
        } else if outcome.status != OutcomeStatus::Restricted {
            outcome.status = OutcomeStatus::Error;
            outcome
                .error_detail
                .get_or_insert_with(|| NOTHING_GRANTED.to_string());
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::drive::{DEFAULT_MAX_OBJECTS, DEFAULT_PAGE_SIZE};
    use crate::executor::{PacingConfig, RateLimiterState};
    use crate::testing::{self, ScriptedTransport};
    use migration_types::ObjectKind;
    use reqwest::{Method, Url};

    fn migrator(transport: &Arc<ScriptedTransport>) -> PermissionMigrator {
        let limiter = Arc::new(RateLimiterState::new(PacingConfig::default()));
        let drive = DriveClient::new(
            Arc::new(testing::executor(transport, limiter, 0)),
            Url::parse("https://drive.test/drive/v3").unwrap(),
            DEFAULT_PAGE_SIZE,
            DEFAULT_MAX_OBJECTS,
        );
        PermissionMigrator::new(Arc::new(drive))
    }

    fn perm(role: &str, principal_type: PrincipalType, principal: Option<&str>) -> Permission {
        Permission {
            role: role.to_string(),
            principal_type,
            principal: principal.map(str::to_string),
        }
    }

    fn object(id: &str, permissions: Vec<Permission>) -> RemoteObject {
        RemoteObject {
            id: id.to_string(),
            name: format!("{id}.doc"),
            kind: ObjectKind::Leaf,
            shareable: true,
            permissions,
        }
    }

    fn mapping() -> IdentityMapping {
        IdentityMapping::from([
            ("bob@old.example.com".to_string(), "bob@new.example.com".to_string()),
            ("carol@old.example.com".to_string(), "carol@new.example.com".to_string()),
            ("team@old.example.com".to_string(), "team@new.example.com".to_string()),
        ])
    }

    #[test]
    fn test_ineligible_principals_filtered() {
        assert_eq!(
            migratable_principal(&perm("writer", PrincipalType::User, Some("bob@old.example.com"))),
            Some("bob@old.example.com")
        );
        assert_eq!(
            migratable_principal(&perm("owner", PrincipalType::User, Some("bob@old.example.com"))),
            None
        );
        assert_eq!(migratable_principal(&perm("reader", PrincipalType::Domain, None)), None);
        assert_eq!(migratable_principal(&perm("reader", PrincipalType::Anyone, None)), None);
        assert_eq!(
            migratable_principal(&perm("reader", PrincipalType::Group, Some("team@old.example.com"))),
            None
        );
        assert_eq!(migratable_principal(&perm("reader", PrincipalType::User, Some("  "))), None);
        assert_eq!(migratable_principal(&perm("reader", PrincipalType::User, None)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unshareable_object_restricted_without_calls() {
        let transport = testing::scripted_transport();
        let mut locked = object("f1", vec![perm("writer", PrincipalType::User, Some("bob@old.example.com"))]);
        locked.shareable = false;

        let outcome = migrator(&transport).migrate(&locked, &mapping(), "alice@example.com").await;

        assert_eq!(outcome.status, OutcomeStatus::Restricted);
        assert_eq!(outcome.error_detail.as_deref(), Some(SHARING_RESTRICTED));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_permissions_skipped_without_calls() {
        let transport = testing::scripted_transport();

        let outcome = migrator(&transport)
            .migrate(&object("f1", vec![]), &mapping(), "alice@example.com")
            .await;

        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.error_detail.as_deref(), Some(NO_PERMISSIONS));
        assert_eq!(outcome.permissions_added, 0);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_ineligible_permissions_never_mutated() {
        let transport = testing::scripted_transport();
        let target = object(
            "f1",
            vec![
                perm("owner", PrincipalType::User, Some("bob@old.example.com")),
                perm("reader", PrincipalType::Domain, None),
                perm("reader", PrincipalType::Anyone, None),
                perm("writer", PrincipalType::Group, Some("team@old.example.com")),
                perm("writer", PrincipalType::User, Some("dave@unmapped.example.com")),
            ],
        );

        let outcome = migrator(&transport).migrate(&target, &mapping(), "alice@example.com").await;

        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.error_detail.as_deref(), Some(NOTHING_TO_MIGRATE));
        assert_eq!(transport.count(Method::POST, "/permissions"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mapped_permissions_granted() {
        let transport = testing::scripted_transport();
        transport.respond(Method::POST, "/permissions", 200, r#"{"id":"p"}"#);
        let target = object(
            "f1",
            vec![
                perm("owner", PrincipalType::User, Some("alice@example.com")),
                perm("writer", PrincipalType::User, Some("bob@old.example.com")),
                perm("commenter", PrincipalType::User, Some("carol@old.example.com")),
            ],
        );

        let outcome = migrator(&transport).migrate(&target, &mapping(), "alice@example.com").await;

        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.permissions_added, 2);
        assert_eq!(outcome.old_identity.as_deref(), Some("carol@old.example.com"));
        assert_eq!(outcome.new_identity.as_deref(), Some("carol@new.example.com"));
        assert_eq!(outcome.role.as_deref(), Some("commenter"));
        assert_eq!(outcome.access_level, Some(AccessLevel::Comment));

        let sent = transport.requests_to(Method::POST, "/permissions");
        let grantees: Vec<_> = sent
            .iter()
            .map(|r| r.json.as_ref().unwrap()["emailAddress"].clone())
            .collect();
        assert_eq!(grantees, vec!["bob@new.example.com", "carol@new.example.com"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restricted_failure_classified() {
        let transport = testing::scripted_transport();
        transport.respond(
            Method::POST,
            "/permissions",
            400,
            r#"{"error":{"reason":"sharingNotAllowed"}}"#,
        );
        let target = object("f1", vec![perm("writer", PrincipalType::User, Some("bob@old.example.com"))]);

        let outcome = migrator(&transport).migrate(&target, &mapping(), "alice@example.com").await;

        assert_eq!(outcome.status, OutcomeStatus::Restricted);
        assert!(outcome.error_detail.unwrap().contains("sharingNotAllowed"));
        assert_eq!(outcome.permissions_added, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_restriction_wins_over_error() {
        let transport = testing::scripted_transport();
        transport.respond(Method::POST, "/permissions", 500, "backend error");
        transport.respond(Method::POST, "/permissions", 400, "target is flagged");
        let target = object(
            "f1",
            vec![
                perm("writer", PrincipalType::User, Some("bob@old.example.com")),
                perm("reader", PrincipalType::User, Some("carol@old.example.com")),
            ],
        );

        let outcome = migrator(&transport).migrate(&target, &mapping(), "alice@example.com").await;

        assert_eq!(outcome.status, OutcomeStatus::Restricted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_after_restriction_is_error() {
        let transport = testing::scripted_transport();
        transport.respond(Method::POST, "/permissions", 400, "sharing restricted");
        transport.respond(Method::POST, "/permissions", 500, "backend error");
        let target = object(
            "f1",
            vec![
                perm("writer", PrincipalType::User, Some("bob@old.example.com")),
                perm("reader", PrincipalType::User, Some("carol@old.example.com")),
            ],
        );

        let outcome = migrator(&transport).migrate(&target, &mapping(), "alice@example.com").await;

        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(outcome.error_detail.unwrap().contains("backend error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_success_wins() {
        let transport = testing::scripted_transport();
        transport.respond(Method::POST, "/permissions", 200, "{}");
        transport.respond(Method::POST, "/permissions", 500, "backend error");
        let target = object(
            "f1",
            vec![
                perm("writer", PrincipalType::User, Some("bob@old.example.com")),
                perm("reader", PrincipalType::User, Some("carol@old.example.com")),
            ],
        );

        let outcome = migrator(&transport).migrate(&target, &mapping(), "alice@example.com").await;

        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.permissions_added, 1);
    }
}
