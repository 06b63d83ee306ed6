//! Entities mapped from rows.
//!
//! Rows with JSON columns are read into a `*Row` struct first and converted
//! with `TryFrom`, so callers only ever see typed values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::TraceError;
use crate::model::{JobStatus, PackingStatus, QrStatus, ReceivingStatus, ValidationStatus};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: i64,
    pub order_id: i64,
    pub manufacturer_org_id: i64,
    pub code_prefix: String,
    pub packing_status: PackingStatus,
    pub receiving_status: ReceivingStatus,
    pub total_unique_codes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct QrCode {
    pub id: i64,
    pub code: String,
    pub status: QrStatus,
    pub batch_id: i64,
    pub master_code_id: Option<i64>,
    pub variant_id: Option<i64>,
    pub order_id: i64,
    pub current_owner_org_id: Option<i64>,
    pub sequence_number: i64,
    pub case_number: Option<i64>,
    pub variant_key: Option<String>,
    pub is_blocked: bool,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub last_scanned_by: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MasterCode {
    pub id: i64,
    pub master_code: String,
    pub case_number: i64,
    pub batch_id: i64,
    pub status: QrStatus,
    pub expected_unit_count: i64,
    pub actual_unit_count: i64,
    pub warehouse_org_id: Option<i64>,
    pub manufacturer_org_id: Option<i64>,
    pub distributor_org_id: Option<i64>,
    pub shipment_order_id: Option<i64>,
    pub receive_order_id: Option<i64>,
    pub manufacturer_scanned_at: Option<DateTime<Utc>>,
}

impl MasterCode {
    /// Units in the case: the scanned count, or the planned count when nothing was scanned yet.
    pub fn unit_count(&self) -> i64 {
        if self.actual_unit_count > 0 {
            self.actual_unit_count
        } else {
            self.expected_unit_count
        }
    }
}

/// Summary written when a reverse job completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub prepared: i64,
    pub duplicates: i64,
    pub invalid: i64,
    pub total_available: i64,
    pub excluded_count: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ReverseJobRow {
    pub id: i64,
    pub batch_id: i64,
    pub order_id: i64,
    pub manufacturer_org_id: i64,
    pub spoiled_case_number: Option<i64>,
    pub spoiled_variant_key: Option<String>,
    pub filter_variant_id: Option<i64>,
    pub filter_case_numbers: Option<String>,
    pub exclude_codes: String,
    pub status: JobStatus,
    pub progress: i64,
    pub prepared_count: i64,
    pub duplicate_count: i64,
    pub invalid_count: i64,
    pub total_available_in_batch: i64,
    pub remaining_to_prepare: i64,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseJob {
    pub id: i64,
    pub batch_id: i64,
    pub order_id: i64,
    pub manufacturer_org_id: i64,
    pub spoiled_case_number: Option<i64>,
    pub spoiled_variant_key: Option<String>,
    pub filter_variant_id: Option<i64>,
    pub filter_case_numbers: Option<Vec<i64>>,
    pub exclude_codes: Vec<String>,
    pub status: JobStatus,
    pub progress: i64,
    pub prepared_count: i64,
    pub duplicate_count: i64,
    pub invalid_count: i64,
    pub total_available_in_batch: i64,
    pub remaining_to_prepare: i64,
    pub result_summary: Option<JobSummary>,
    pub error_message: Option<String>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReverseJobRow> for ReverseJob {
    type Error = TraceError;

    fn try_from(row: ReverseJobRow) -> Result<Self, Self::Error> {
        let filter_case_numbers = row
            .filter_case_numbers
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let result_summary = row
            .result_summary
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(ReverseJob {
            id: row.id,
            batch_id: row.batch_id,
            order_id: row.order_id,
            manufacturer_org_id: row.manufacturer_org_id,
            spoiled_case_number: row.spoiled_case_number,
            spoiled_variant_key: row.spoiled_variant_key,
            filter_variant_id: row.filter_variant_id,
            filter_case_numbers,
            exclude_codes: serde_json::from_str(&row.exclude_codes)?,
            status: row.status,
            progress: row.progress,
            prepared_count: row.prepared_count,
            duplicate_count: row.duplicate_count,
            invalid_count: row.invalid_count,
            total_available_in_batch: row.total_available_in_batch,
            remaining_to_prepare: row.remaining_to_prepare,
            result_summary,
            error_message: row.error_message,
            created_by: row.created_by,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReverseJobItem {
    pub id: i64,
    pub job_id: i64,
    pub code_id: i64,
    pub code: String,
    pub sequence_number: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReverseJobLog {
    pub id: i64,
    pub job_id: i64,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreparedCode {
    pub id: i64,
    pub order_id: i64,
    pub batch_id: i64,
    pub code: String,
    pub code_id: i64,
    pub job_id: i64,
}

/// Units and cases for one product variant.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VariantQuantity {
    pub cases: i64,
    pub units: i64,
}

/// Inventory snapshot taken when a session starts. Variant keys are the
/// product variant id as text; `"unassigned"` collects cases with no variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedQuantities {
    pub cases_available: i64,
    pub units_available: i64,
    pub by_variant: std::collections::BTreeMap<String, VariantQuantity>,
}

/// Scan accumulator, same shape as the snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScannedQuantities {
    pub total_cases: i64,
    pub total_units: i64,
    pub by_variant: std::collections::BTreeMap<String, VariantQuantity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Shortfall {
    /// Master code string or variant key the shortfall is attributed to.
    pub reference: String,
    pub expected_units: i64,
    pub actual_units: i64,
    pub missing_units: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscrepancyDetails {
    pub shortfalls: Vec<Shortfall>,
    pub warnings: Vec<String>,
}

impl DiscrepancyDetails {
    /// Warnings alone do not block a match; shortfalls do.
    pub fn has_discrepancy(&self) -> bool {
        self.shortfalls.iter().any(|s| s.missing_units > 0)
    }
}

/// Where a scanned case stood before the session shipped it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackedCase {
    pub master_code_id: i64,
    pub previous_shipment_order_id: Option<i64>,
    pub previous_distributor_org_id: Option<i64>,
}

/// A unit the session moved to `warehouse_packed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackedUnit {
    pub code_id: i64,
    /// The scanned case that carried it; `None` for a loose scan.
    pub master_code_id: Option<i64>,
    pub previous_owner_org_id: Option<i64>,
}

/// Everything cancel has to put back. Units a scan skipped are not listed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackedState {
    pub cases: Vec<PackedCase>,
    pub units: Vec<PackedUnit>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ValidationSessionRow {
    pub id: i64,
    pub warehouse_org_id: i64,
    pub distributor_org_id: i64,
    pub source_order_id: Option<i64>,
    pub destination_order_id: Option<i64>,
    pub expected_quantities: String,
    pub scanned_quantities: String,
    pub master_codes_scanned: String,
    pub unique_codes_scanned: String,
    pub discrepancy_details: String,
    pub packed_state: String,
    pub validation_status: ValidationStatus,
    pub is_matched: bool,
    pub approved_by: Option<i64>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approval_notes: Option<String>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSession {
    pub id: i64,
    pub warehouse_org_id: i64,
    pub distributor_org_id: i64,
    pub source_order_id: Option<i64>,
    pub destination_order_id: Option<i64>,
    pub expected_quantities: ExpectedQuantities,
    pub scanned_quantities: ScannedQuantities,
    pub master_codes_scanned: Vec<i64>,
    pub unique_codes_scanned: Vec<i64>,
    pub discrepancy_details: DiscrepancyDetails,
    #[serde(skip)]
    pub packed_state: PackedState,
    pub validation_status: ValidationStatus,
    pub is_matched: bool,
    pub approved_by: Option<i64>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approval_notes: Option<String>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ValidationSessionRow> for ValidationSession {
    type Error = TraceError;

    fn try_from(row: ValidationSessionRow) -> Result<Self, Self::Error> {
        Ok(ValidationSession {
            id: row.id,
            warehouse_org_id: row.warehouse_org_id,
            distributor_org_id: row.distributor_org_id,
            source_order_id: row.source_order_id,
            destination_order_id: row.destination_order_id,
            expected_quantities: serde_json::from_str(&row.expected_quantities)?,
            scanned_quantities: serde_json::from_str(&row.scanned_quantities)?,
            master_codes_scanned: serde_json::from_str(&row.master_codes_scanned)?,
            unique_codes_scanned: serde_json::from_str(&row.unique_codes_scanned)?,
            discrepancy_details: serde_json::from_str(&row.discrepancy_details)?,
            packed_state: serde_json::from_str(&row.packed_state)?,
            validation_status: row.validation_status,
            is_matched: row.is_matched,
            approved_by: row.approved_by,
            approved_at: row.approved_at,
            approval_notes: row.approval_notes,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Movement {
    pub id: i64,
    pub code_id: Option<i64>,
    pub master_code_id: Option<i64>,
    pub from_org_id: Option<i64>,
    pub to_org_id: Option<i64>,
    pub movement_type: String,
    pub session_id: Option<i64>,
    pub notes: Option<String>,
}
