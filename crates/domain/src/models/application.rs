//! Job application records and the closed set of exportable fields.
//!
//! Applications are owned by the record-keeping side of the backend; the
//! export engine only reads them, one keyset-paginated batch at a time.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A job application as read from the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobApplication {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub company: String,
    pub position: String,
    pub status: String,
    pub location: Option<String>,
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    pub source: Option<String>,
    pub job_url: Option<String>,
    pub notes: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Keyset position within an owner's applications, ordered by
/// `(created_at, id)` ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

/// A single typed output value.
///
/// Writers decide the concrete encoding: delimited text renders everything
/// as text, spreadsheets keep integers numeric.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Integer(i64),
    Timestamp(DateTime<Utc>),
}

impl Cell {
    /// Plain-text rendering used by text-based formats.
    pub fn to_text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Integer(n) => n.to_string(),
            Cell::Timestamp(ts) => ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }

    /// JSON rendering used by the JSON writer.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Empty => serde_json::Value::Null,
            Cell::Text(s) => serde_json::Value::String(s.clone()),
            Cell::Integer(n) => serde_json::Value::from(*n),
            Cell::Timestamp(_) => serde_json::Value::String(self.to_text()),
        }
    }
}

impl From<Option<String>> for Cell {
    fn from(value: Option<String>) -> Self {
        value.map(Cell::Text).unwrap_or(Cell::Empty)
    }
}

impl From<Option<i64>> for Cell {
    fn from(value: Option<i64>) -> Self {
        value.map(Cell::Integer).unwrap_or(Cell::Empty)
    }
}

impl From<Option<DateTime<Utc>>> for Cell {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        value.map(Cell::Timestamp).unwrap_or(Cell::Empty)
    }
}

/// Exportable application fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportField {
    Id,
    Company,
    Position,
    Status,
    Location,
    SalaryMin,
    SalaryMax,
    Source,
    JobUrl,
    Notes,
    AppliedAt,
    CreatedAt,
    UpdatedAt,
}

impl ExportField {
    /// Every field, in default column order.
    pub const ALL: [ExportField; 13] = [
        ExportField::Id,
        ExportField::Company,
        ExportField::Position,
        ExportField::Status,
        ExportField::Location,
        ExportField::SalaryMin,
        ExportField::SalaryMax,
        ExportField::Source,
        ExportField::JobUrl,
        ExportField::Notes,
        ExportField::AppliedAt,
        ExportField::CreatedAt,
        ExportField::UpdatedAt,
    ];

    /// Machine key, as accepted in filter specs.
    pub fn key(&self) -> &'static str {
        match self {
            ExportField::Id => "id",
            ExportField::Company => "company",
            ExportField::Position => "position",
            ExportField::Status => "status",
            ExportField::Location => "location",
            ExportField::SalaryMin => "salary_min",
            ExportField::SalaryMax => "salary_max",
            ExportField::Source => "source",
            ExportField::JobUrl => "job_url",
            ExportField::Notes => "notes",
            ExportField::AppliedAt => "applied_at",
            ExportField::CreatedAt => "created_at",
            ExportField::UpdatedAt => "updated_at",
        }
    }

    /// Column header written in exported files.
    pub fn header(&self) -> &'static str {
        match self {
            ExportField::Id => "ID",
            ExportField::Company => "Company",
            ExportField::Position => "Position",
            ExportField::Status => "Status",
            ExportField::Location => "Location",
            ExportField::SalaryMin => "Salary Min",
            ExportField::SalaryMax => "Salary Max",
            ExportField::Source => "Source",
            ExportField::JobUrl => "Job URL",
            ExportField::Notes => "Notes",
            ExportField::AppliedAt => "Applied At",
            ExportField::CreatedAt => "Created At",
            ExportField::UpdatedAt => "Updated At",
        }
    }

    /// Sample value shown by the template endpoint.
    pub fn example(&self) -> Cell {
        let sample_time = Utc
            .with_ymd_and_hms(2024, 3, 1, 9, 30, 0)
            .single()
            .unwrap_or_else(Utc::now);
        match self {
            ExportField::Id => Cell::Text("6f1c2d9e-4b7a-4e0f-9a51-2c3d4e5f6a7b".to_string()),
            ExportField::Company => Cell::Text("Acme Corp".to_string()),
            ExportField::Position => Cell::Text("Backend Engineer".to_string()),
            ExportField::Status => Cell::Text("interviewing".to_string()),
            ExportField::Location => Cell::Text("Remote".to_string()),
            ExportField::SalaryMin => Cell::Integer(90_000),
            ExportField::SalaryMax => Cell::Integer(120_000),
            ExportField::Source => Cell::Text("referral".to_string()),
            ExportField::JobUrl => Cell::Text("https://jobs.example.com/1234".to_string()),
            ExportField::Notes => Cell::Text("Second round scheduled".to_string()),
            ExportField::AppliedAt | ExportField::CreatedAt | ExportField::UpdatedAt => {
                Cell::Timestamp(sample_time)
            }
        }
    }
}

impl fmt::Display for ExportField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ExportField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExportField::ALL
            .iter()
            .copied()
            .find(|field| field.key() == s.to_lowercase())
            .ok_or_else(|| format!("Unknown export field: {}", s))
    }
}

impl JobApplication {
    /// Value of one field of this record.
    pub fn cell(&self, field: ExportField) -> Cell {
        match field {
            ExportField::Id => Cell::Text(self.id.to_string()),
            ExportField::Company => Cell::Text(self.company.clone()),
            ExportField::Position => Cell::Text(self.position.clone()),
            ExportField::Status => Cell::Text(self.status.clone()),
            ExportField::Location => self.location.clone().into(),
            ExportField::SalaryMin => self.salary_min.into(),
            ExportField::SalaryMax => self.salary_max.into(),
            ExportField::Source => self.source.clone().into(),
            ExportField::JobUrl => self.job_url.clone().into(),
            ExportField::Notes => self.notes.clone().into(),
            ExportField::AppliedAt => self.applied_at.into(),
            ExportField::CreatedAt => Cell::Timestamp(self.created_at),
            ExportField::UpdatedAt => Cell::Timestamp(self.updated_at),
        }
    }

    /// Values for the selected columns, in order.
    pub fn row(&self, fields: &[ExportField]) -> Vec<Cell> {
        fields.iter().map(|f| self.cell(*f)).collect()
    }

    /// Keyset position of this record.
    pub fn cursor(&self) -> RecordCursor {
        RecordCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }
}
