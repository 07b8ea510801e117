// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Object store client
//!
//! Lists an identity's objects page by page, grants permissions on a single
//! object, and probes connectivity. All calls go through the shared
//! [`RequestExecutor`].

use std::sync::Arc;

use migration_types::{
    Identity, ObjectKind, Permission, PrincipalType, RemoteObject,
};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::executor::{self, ApiError, CallKind, RequestExecutor};
use crate::transport::ApiRequest;

/// Default object store API root
pub const DEFAULT_DRIVE_BASE_URL: &str = "https://www.googleapis.com/drive/v3";

pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// Hard cap on objects listed for one identity
pub const DEFAULT_MAX_OBJECTS: usize = 10_000;

const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,owners,permissions(role,emailAddress,type),capabilities)";

const UNNAMED_OBJECT: &str = "Unnamed File";

/// One parsed listing page
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ObjectPage {
    pub objects: Vec<RemoteObject>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePage {
    #[serde(default)]
    files: Vec<Value>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireObject {
    id: String,
    name: Option<String>,
    mime_type: Option<String>,
    #[serde(default)]
    permissions: Vec<Value>,
    capabilities: Option<WireCapabilities>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCapabilities {
    can_share: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePermission {
    role: Option<String>,
    #[serde(rename = "type")]
    principal_type: Option<PrincipalType>,
    email_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutResponse {
    user: Option<AboutUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutUser {
    email_address: Option<String>,
}

fn parse_permission(value: Value) -> Option<Permission> {
    let wire: WirePermission = serde_json::from_value(value).ok()?;
    let role = wire.role.filter(|r| !r.is_empty())?;

    Some(Permission {
        role,
        principal_type: wire.principal_type.unwrap_or(PrincipalType::Unknown),
        principal: wire.email_address.filter(|e| !e.trim().is_empty()),
    })
}

fn parse_object(value: Value) -> Option<RemoteObject> {
    let wire: WireObject = match serde_json::from_value(value) {
        Ok(w) => w,
        Err(e) => {
            debug!(error = %e, "Dropping malformed object record");
            return None;
        }
    };

    if wire.id.is_empty() {
        debug!("Dropping object record without id");
        return None;
    }

    let shareable = wire
        .capabilities
        .and_then(|c| c.can_share)
        .unwrap_or(true);

    Some(RemoteObject {
        id: wire.id,
        name: wire.name.unwrap_or_else(|| UNNAMED_OBJECT.to_string()),
        kind: ObjectKind::from_mime_type(wire.mime_type.as_deref()),
        shareable,
        permissions: wire
            .permissions
            .into_iter()
            .filter_map(parse_permission)
            .collect(),
    })
}

/// Parse one listing page.
///
/// Only a body that is not a JSON object at all is an error. Object records
/// that fail to parse (or lack an id) are dropped, as are permission entries
/// without a role; the rest of the page is kept.
pub fn parse_object_page(bytes: &[u8]) -> Result<ObjectPage, ApiError> {
    let page: WirePage =
        serde_json::from_slice(bytes).map_err(|e| ApiError::Decode(e.to_string()))?;

    Ok(ObjectPage {
        objects: page.files.into_iter().filter_map(parse_object).collect(),
        next_page_token: page.next_page_token.filter(|t| !t.is_empty()),
    })
}

/// Client for the remote object store
pub struct DriveClient {
    executor: Arc<RequestExecutor>,
    base_url: Url,
    page_size: u32,
    max_objects: usize,
}

impl DriveClient {
    pub fn new(
        executor: Arc<RequestExecutor>,
        base_url: Url,
        page_size: u32,
        max_objects: usize,
    ) -> Self {
        Self {
            executor,
            base_url,
            page_size,
            max_objects,
        }
    }

    /// Current write spacing of the underlying executor
    pub fn write_delay_ms(&self) -> u64 {
        self.executor.limiter().delay_ms()
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// List every non-trashed object visible to `identity`, in arrival order.
    pub async fn list_all(&self, identity: &str) -> Result<Vec<RemoteObject>, ApiError> {
        let mut objects: Vec<RemoteObject> = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let mut url = self.endpoint(&["files"])?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("pageSize", &self.page_size.to_string())
                    .append_pair("q", "trashed=false")
                    .append_pair("fields", LIST_FIELDS);
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let response = self
                .executor
                .execute(ApiRequest::get(url), identity, CallKind::Read)
                .await?;
            let page = parse_object_page(response.body.as_bytes())?;
            pages += 1;
            objects.extend(page.objects);

            debug!(
                identity = %identity,
                page = pages,
                listed = objects.len(),
                "Fetched object page"
            );

            match page.next_page_token {
                Some(token) if objects.len() < self.max_objects => page_token = Some(token),
                _ => break,
            }
        }

        if objects.len() > self.max_objects {
            warn!(
                identity = %identity,
                listed = objects.len(),
                cap = self.max_objects,
                "Listing exceeded object cap, truncating"
            );
            objects.truncate(self.max_objects);
        }

        info!(identity = %identity, total = objects.len(), "Listed objects");
        Ok(objects)
    }

    /// Grant `role` on `object_id` to `grantee`, acting as `identity`.
    pub async fn add_permission(
        &self,
        identity: &str,
        object_id: &str,
        role: &str,
        grantee: &Identity,
    ) -> Result<(), ApiError> {
        let mut url = self.endpoint(&["files", object_id, "permissions"])?;
        url.query_pairs_mut()
            .append_pair("sendNotificationEmail", "false")
            .append_pair("supportsAllDrives", "true");

        let body = serde_json::json!({
            "type": "user",
            "role": role,
            "emailAddress": grantee,
        });

        self.executor
            .execute(ApiRequest::post_json(url, body), identity, CallKind::Write)
            .await?;
        Ok(())
    }

    /// Read the identity probe endpoint; returns the address the service
    /// reports for the impersonated user.
    pub async fn test_connection(&self, identity: &str) -> Result<Option<String>, ApiError> {
        let mut url = self.endpoint(&["about"])?;
        url.query_pairs_mut().append_pair("fields", "user");

        let response = self
            .executor
            .execute(ApiRequest::get(url), identity, CallKind::Read)
            .await?;
        let about: AboutResponse = executor::decode(&response)?;

        Ok(about.user.and_then(|u| u.email_address))
    }
}
