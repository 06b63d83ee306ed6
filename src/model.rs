use serde::{Deserialize, Serialize};
use std::fmt;

/// Shared status vocabulary for Unique Codes and Master Codes.
///
/// The first six values are ordered; `Spoiled` and `Void` are absorbing and
/// sit outside the ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum QrStatus {
    Generated,
    Packed,
    ShippedDistributor,
    ReceivedWarehouse,
    WarehousePacked,
    Opened,
    Spoiled,
    Void,
}

impl QrStatus {
    pub const ORDERED: [QrStatus; 6] = [
        QrStatus::Generated,
        QrStatus::Packed,
        QrStatus::ShippedDistributor,
        QrStatus::ReceivedWarehouse,
        QrStatus::WarehousePacked,
        QrStatus::Opened,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QrStatus::Generated => "generated",
            QrStatus::Packed => "packed",
            QrStatus::ShippedDistributor => "shipped_distributor",
            QrStatus::ReceivedWarehouse => "received_warehouse",
            QrStatus::WarehousePacked => "warehouse_packed",
            QrStatus::Opened => "opened",
            QrStatus::Spoiled => "spoiled",
            QrStatus::Void => "void",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "generated" => Some(QrStatus::Generated),
            "packed" => Some(QrStatus::Packed),
            "shipped_distributor" => Some(QrStatus::ShippedDistributor),
            "received_warehouse" => Some(QrStatus::ReceivedWarehouse),
            "warehouse_packed" => Some(QrStatus::WarehousePacked),
            "opened" => Some(QrStatus::Opened),
            "spoiled" => Some(QrStatus::Spoiled),
            "void" => Some(QrStatus::Void),
            _ => None,
        }
    }

    /// Position in the shared ordering; `None` for absorbing states.
    pub fn rank(&self) -> Option<usize> {
        Self::ORDERED.iter().position(|s| s == self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QrStatus::Spoiled | QrStatus::Void)
    }

    /// The status one step forward in the ordering.
    pub fn next(&self) -> Option<QrStatus> {
        self.rank().and_then(|r| Self::ORDERED.get(r + 1).copied())
    }
}

impl fmt::Display for QrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Matched,
    Discrepancy,
    Approved,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Matched => "matched",
            ValidationStatus::Discrepancy => "discrepancy",
            ValidationStatus::Approved => "approved",
        }
    }
}

/// Batch packing progress. Forward-only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PackingStatus {
    Pending,
    InProgress,
    Completed,
}

impl PackingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackingStatus::Pending => "pending",
            PackingStatus::InProgress => "in_progress",
            PackingStatus::Completed => "completed",
        }
    }
}

/// Batch receiving progress. Forward-only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ReceivingStatus {
    Pending,
    Partial,
    Completed,
}

impl ReceivingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceivingStatus::Pending => "pending",
            ReceivingStatus::Partial => "partial",
            ReceivingStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    WarehouseShip,
    WarehouseCancel,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::WarehouseShip => "warehouse_ship",
            MovementType::WarehouseCancel => "warehouse_cancel",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_and_terminal_states() {
        assert_eq!(QrStatus::Generated.rank(), Some(0));
        assert_eq!(QrStatus::Opened.rank(), Some(5));
        assert_eq!(QrStatus::Spoiled.rank(), None);
        assert_eq!(QrStatus::ReceivedWarehouse.next(), Some(QrStatus::WarehousePacked));
        assert_eq!(QrStatus::Opened.next(), None);
        assert!(QrStatus::Void.is_terminal());
        assert!(!QrStatus::Packed.is_terminal());
    }

    #[test]
    fn status_strings_round_trip() {
        for s in QrStatus::ORDERED.iter().chain([QrStatus::Spoiled, QrStatus::Void].iter()) {
            assert_eq!(QrStatus::parse_status(s.as_str()), Some(*s));
        }
        assert_eq!(QrStatus::parse_status("scanned"), None);
    }
}
