// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Tracking store client
//!
//! The tracking store is a spreadsheet. `Sheet1` holds the roster with one
//! status row per identity, `Sheet2` holds the old-to-new identity mapping,
//! each identity gets a `Detail_*` sheet of per-object outcomes, and
//! `Migration_Logs` collects operator-visible log lines.
//!
//! Every call goes through a dedicated [`RequestExecutor`] whose limiter is
//! configured with a fixed spacing, and impersonates the service identity
//! itself rather than a migrated user.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use migration_types::{
    FileOutcome, IdentityMapping, IdentityRecord, IdentityStatus, MigrationStats,
};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::executor::{self, ApiError, CallKind, RequestExecutor};
use crate::transport::ApiRequest;
use crate::writeback::BatchSink;

pub const DEFAULT_SHEETS_BASE_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";
pub const DEFAULT_STORE_CALL_INTERVAL_MS: u64 = 1200;
/// UTC+7
pub const DEFAULT_DISPLAY_UTC_OFFSET_MINUTES: i32 = 420;

const DOCUMENT_BASE_URL: &str = "https://docs.google.com/spreadsheets/d";
const ROSTER_SHEET: &str = "Sheet1";
const MAPPING_SHEET: &str = "Sheet2";
const LOG_SHEET: &str = "Migration_Logs";
const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

pub const ROSTER_HEADER: [&str; 9] = [
    "Email",
    "Start Date",
    "End Date",
    "Status",
    "Total Files",
    "Successful Files",
    "Failed Files",
    "Restricted Files",
    "Detail Link",
];

pub const DETAIL_HEADER: [&str; 10] = [
    "Timestamp",
    "File Name",
    "File ID",
    "Type",
    "Permission Type",
    "Status",
    "Old Email",
    "New Email",
    "Role",
    "Error Message",
];

const LOG_HEADER: [&str; 4] = ["Timestamp", "Level", "Message", "Details"];

// Roster columns (0-based)
const COL_IDENTITY: usize = 0;
const COL_STATUS: usize = 3;
const COL_TOTAL: usize = 4;
const COL_SUCCESS: usize = 5;
const COL_FAILED: usize = 6;
const COL_RESTRICTED: usize = 7;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Tracking store request failed: {0}")]
    Api(#[from] ApiError),

    #[error("Display offset out of range: {0} minutes")]
    InvalidOffset(i32),
}

#[derive(Debug, Default, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: Option<i64>,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Default, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddSheetReply {
    add_sheet: Option<SheetEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct BatchUpdateResponse {
    #[serde(default)]
    replies: Vec<AddSheetReply>,
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn text_rows(range: ValueRange) -> Vec<Vec<String>> {
    range
        .values
        .into_iter()
        .map(|row| row.iter().map(cell_text).collect())
        .collect()
}

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(|s| s.trim()).unwrap_or("")
}

fn count(row: &[String], index: usize) -> usize {
    cell(row, index).parse().unwrap_or(0)
}

/// Parse roster rows (header row first) into identity records.
pub fn parse_roster(rows: &[Vec<String>]) -> Vec<IdentityRecord> {
    rows.iter()
        .enumerate()
        .skip(1)
        .filter_map(|(i, row)| {
            let identity = cell(row, COL_IDENTITY);
            if identity.is_empty() {
                return None;
            }

            let status = cell(row, COL_STATUS)
                .parse::<IdentityStatus>()
                .unwrap_or_default();
            let success = count(row, COL_SUCCESS);
            let failed = count(row, COL_FAILED);
            let restricted = count(row, COL_RESTRICTED);

            Some(IdentityRecord {
                identity: identity.to_string(),
                row_index: u32::try_from(i + 1).unwrap_or(u32::MAX),
                status,
                prior: MigrationStats {
                    total: count(row, COL_TOTAL),
                    success,
                    failed,
                    restricted,
                    skipped: 0,
                },
            })
        })
        .collect()
}

/// Parse mapping rows. A first row whose first cell mentions "old" is a
/// header; rows missing either side are ignored.
pub fn parse_mapping(rows: &[Vec<String>]) -> IdentityMapping {
    let has_header = rows
        .first()
        .is_some_and(|row| cell(row, 0).to_lowercase().contains("old"));

    rows.iter()
        .skip(usize::from(has_header))
        .filter_map(|row| {
            let old = cell(row, 0);
            let new = cell(row, 1);
            (!old.is_empty() && !new.is_empty()).then(|| (old.to_string(), new.to_string()))
        })
        .collect()
}

/// Title of the per-identity detail sheet
pub fn detail_sheet_name(identity: &str) -> String {
    format!("Detail_{}", identity.replace('@', "_at_").replace('.', "_"))
}

fn header_row(header: &[&str]) -> Vec<String> {
    header.iter().map(|h| h.to_string()).collect()
}

fn detail_row(stamp: &str, outcome: &FileOutcome) -> Vec<String> {
    vec![
        stamp.to_string(),
        outcome.object_name.clone(),
        outcome.object_id.clone(),
        outcome.object_kind.label().to_string(),
        outcome
            .access_level
            .map(|a| a.to_string())
            .unwrap_or_default(),
        outcome.status.to_string(),
        outcome.old_identity.clone().unwrap_or_default(),
        outcome.new_identity.clone().unwrap_or_default(),
        outcome.role.clone().unwrap_or_default(),
        outcome.error_detail.clone().unwrap_or_default(),
    ]
}

pub struct SheetsStore {
    executor: RequestExecutor,
    base_url: Url,
    spreadsheet_id: String,
    display_offset: FixedOffset,
    sheet_ids: RwLock<HashMap<String, i64>>,
    log_sheet_ready: AtomicBool,
}

impl SheetsStore {
    pub fn new(
        executor: RequestExecutor,
        base_url: Url,
        spreadsheet_id: impl Into<String>,
        display_utc_offset_minutes: i32,
    ) -> Result<Self, StoreError> {
        let display_offset = display_utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(StoreError::InvalidOffset(display_utc_offset_minutes))?;

        Ok(Self {
            executor,
            base_url,
            spreadsheet_id: spreadsheet_id.into(),
            display_offset,
            sheet_ids: RwLock::new(HashMap::new()),
            log_sheet_ready: AtomicBool::new(false),
        })
    }

    pub fn spreadsheet_id(&self) -> &str {
        &self.spreadsheet_id
    }

    /// Current time rendered for the store
    pub fn timestamp(&self) -> String {
        Utc::now()
            .with_timezone(&self.display_offset)
            .format(TIMESTAMP_FORMAT)
            .to_string()
    }

    fn acting_as(&self) -> &str {
        self.executor.tokens().issuer()
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let url = self.endpoint(&[&self.spreadsheet_id, "values", range])?;
        let response = self
            .executor
            .execute(ApiRequest::get(url), self.acting_as(), CallKind::Read)
            .await?;
        let range: ValueRange = executor::decode(&response)?;
        Ok(text_rows(range))
    }

    async fn put_values(&self, range: &str, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        let mut url = self.endpoint(&[&self.spreadsheet_id, "values", range])?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");

        self.executor
            .execute(
                ApiRequest::put_json(url, json!({ "values": rows })),
                self.acting_as(),
                CallKind::Write,
            )
            .await?;
        Ok(())
    }

    async fn append_values(
        &self,
        sheet: &str,
        columns: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<(), StoreError> {
        let target = format!("{sheet}!{columns}:append");
        let mut url = self.endpoint(&[&self.spreadsheet_id, "values", &target])?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");

        self.executor
            .execute(
                ApiRequest::post_json(url, json!({ "values": rows })),
                self.acting_as(),
                CallKind::Write,
            )
            .await?;
        Ok(())
    }

    /// Create a sheet, returning its id when the reply carries one.
    async fn add_sheet(&self, title: &str) -> Result<Option<i64>, StoreError> {
        let target = format!("{}:batchUpdate", self.spreadsheet_id);
        let url = self.endpoint(&[&target])?;
        let body = json!({
            "requests": [{ "addSheet": { "properties": { "title": title } } }]
        });

        let response = self
            .executor
            .execute(ApiRequest::post_json(url, body), self.acting_as(), CallKind::Write)
            .await?;
        let reply: BatchUpdateResponse = match executor::decode(&response) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(sheet = %title, error = %e, "Unreadable addSheet reply");
                BatchUpdateResponse::default()
            }
        };

        Ok(reply
            .replies
            .into_iter()
            .filter_map(|r| r.add_sheet)
            .find_map(|s| s.properties.sheet_id))
    }

    async fn lookup_sheet_id(&self, title: &str) -> Result<Option<i64>, StoreError> {
        let mut url = self.endpoint(&[&self.spreadsheet_id])?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets(properties(sheetId,title))");

        let response = self
            .executor
            .execute(ApiRequest::get(url), self.acting_as(), CallKind::Read)
            .await?;
        let meta: SpreadsheetMeta = executor::decode(&response)?;

        Ok(meta
            .sheets
            .into_iter()
            .find(|s| s.properties.title == title)
            .and_then(|s| s.properties.sheet_id))
    }

    /// Write the roster header row unless it is already in place.
    /// Returns whether the header was (re)written.
    pub async fn ensure_main_header(&self) -> Result<bool, StoreError> {
        let range = format!("{ROSTER_SHEET}!A1:I1");
        let current = match self.get_values(&range).await {
            Ok(rows) => rows.into_iter().next(),
            Err(e) => {
                debug!(error = %e, "Could not read roster header, rewriting it");
                None
            }
        };

        let matches = current.is_some_and(|row| {
            row.len() >= ROSTER_HEADER.len()
                && ROSTER_HEADER.iter().zip(&row).all(|(want, have)| *want == have.as_str())
        });
        if matches {
            return Ok(false);
        }

        self.put_values(&range, vec![header_row(&ROSTER_HEADER)])
            .await?;
        info!("Wrote roster header");
        Ok(true)
    }

    /// Read the roster, ensuring its header first.
    pub async fn read_roster(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        self.ensure_main_header().await?;
        let rows = self.get_values(&format!("{ROSTER_SHEET}!A:I")).await?;
        let records = parse_roster(&rows);
        info!(identities = records.len(), "Read roster");
        Ok(records)
    }

    pub async fn read_mapping(&self) -> Result<IdentityMapping, StoreError> {
        let rows = self.get_values(&format!("{MAPPING_SHEET}!A:B")).await?;
        let mapping = parse_mapping(&rows);
        info!(entries = mapping.len(), "Read identity mapping");
        Ok(mapping)
    }

    /// Rewrite an identity's roster row (columns B through I) for `status`.
    pub async fn update_identity_status(
        &self,
        identity: &str,
        row_index: u32,
        status: &IdentityStatus,
        stats: Option<&MigrationStats>,
    ) -> Result<(), StoreError> {
        let cells: Vec<String> = match status {
            IdentityStatus::InProgress => vec![
                self.timestamp(),
                String::new(),
                status.to_string(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                self.detail_sheet_link(identity).await,
            ],
            IdentityStatus::Completed | IdentityStatus::Failed => {
                let stored_start = match self
                    .get_values(&format!("{ROSTER_SHEET}!B{row_index}:B{row_index}"))
                    .await
                {
                    Ok(rows) => rows
                        .into_iter()
                        .next()
                        .and_then(|row| row.into_iter().next())
                        .filter(|s| !s.trim().is_empty()),
                    Err(e) => {
                        debug!(identity = %identity, error = %e, "Could not read start date");
                        None
                    }
                };
                let stats = stats.copied().unwrap_or_default();

                vec![
                    stored_start.unwrap_or_else(|| self.timestamp()),
                    self.timestamp(),
                    status.to_string(),
                    stats.total.to_string(),
                    stats.success.to_string(),
                    stats.failed.to_string(),
                    stats.restricted.to_string(),
                    self.detail_sheet_link(identity).await,
                ]
            }
            IdentityStatus::NotStarted => vec![
                String::new(),
                String::new(),
                status.to_string(),
                "0".to_string(),
                "0".to_string(),
                "0".to_string(),
                "0".to_string(),
                String::new(),
            ],
            IdentityStatus::Other(text) => {
                debug!(identity = %identity, status = %text, "No roster update for status");
                return Ok(());
            }
        };

        let range = format!("{ROSTER_SHEET}!B{row_index}:I{row_index}");
        self.put_values(&range, vec![cells]).await?;
        info!(identity = %identity, row = row_index, status = %status, "Updated identity status");
        Ok(())
    }

    /// Create the identity's detail sheet (or adopt an existing one) and
    /// write its header row. Returns the sheet title.
    pub async fn ensure_detail_sheet(&self, identity: &str) -> Result<String, StoreError> {
        let title = detail_sheet_name(identity);

        let sheet_id = match self.add_sheet(&title).await {
            Ok(Some(id)) => Some(id),
            Ok(None) => match self.lookup_sheet_id(&title).await {
                Ok(id) => id,
                Err(e) => {
                    debug!(sheet = %title, error = %e, "Could not look up new detail sheet id");
                    None
                }
            },
            Err(e) if e.to_string().contains("already exists") => {
                debug!(sheet = %title, "Detail sheet already exists");
                self.lookup_sheet_id(&title).await?
            }
            Err(e) => return Err(e),
        };

        if let Some(id) = sheet_id {
            self.sheet_ids.write().await.insert(identity.to_string(), id);
        }

        self.put_values(&format!("{title}!A1:J1"), vec![header_row(&DETAIL_HEADER)])
            .await?;
        info!(identity = %identity, sheet = %title, "Detail sheet ready");
        Ok(title)
    }

    /// Link to the identity's detail sheet. Falls back to a live lookup of
    /// the sheet id, then to a search link.
    pub async fn detail_sheet_link(&self, identity: &str) -> String {
        if let Some(id) = self.sheet_ids.read().await.get(identity).copied() {
            return format!("{DOCUMENT_BASE_URL}/{}/edit#gid={id}", self.spreadsheet_id);
        }

        let title = detail_sheet_name(identity);
        match self.lookup_sheet_id(&title).await {
            Ok(Some(id)) => {
                self.sheet_ids.write().await.insert(identity.to_string(), id);
                format!("{DOCUMENT_BASE_URL}/{}/edit#gid={id}", self.spreadsheet_id)
            }
            Ok(None) | Err(_) => {
                warn!(identity = %identity, "Could not resolve detail sheet id, using search link");
                format!(
                    "{DOCUMENT_BASE_URL}/{}/edit#search={title}",
                    self.spreadsheet_id
                )
            }
        }
    }

    /// Append a line to the operator log sheet. Failures are logged and
    /// otherwise ignored.
    pub async fn write_log(&self, level: &str, message: &str, details: Option<&str>) {
        if !self.log_sheet_ready.load(Ordering::Acquire) {
            match self.add_sheet(LOG_SHEET).await {
                Ok(_) => {
                    if let Err(e) = self
                        .put_values(&format!("{LOG_SHEET}!A1:D1"), vec![header_row(&LOG_HEADER)])
                        .await
                    {
                        warn!(error = %e, "Failed to write log sheet header");
                    }
                }
                Err(e) => debug!(error = %e, "Log sheet not created, assuming it exists"),
            }
            self.log_sheet_ready.store(true, Ordering::Release);
        }

        let row = vec![
            self.timestamp(),
            level.to_string(),
            message.to_string(),
            details.unwrap_or_default().to_string(),
        ];
        if let Err(e) = self.append_values(LOG_SHEET, "A:D", vec![row]).await {
            warn!(error = %e, level, message, "Failed to write operator log");
        }
    }
}

#[async_trait]
impl BatchSink for SheetsStore {
    async fn append_batch(&self, identity: &str, batch: &[FileOutcome]) -> Result<(), StoreError> {
        let stamp = self.timestamp();
        let rows: Vec<Vec<String>> = batch.iter().map(|o| detail_row(&stamp, o)).collect();
        self.append_values(&detail_sheet_name(identity), "A:J", rows)
            .await
    }
}
