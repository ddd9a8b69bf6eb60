//! Export task domain model.
//!
//! An export task materializes a filtered set of job applications into a
//! downloadable file. Tasks move through a one-directional state machine:
//!
//! ```text
//! Pending --(admitted)--> Running --(success)--> Completed
//!                         Running --(error)----> Failed
//! Pending | Running --(cancel)--> Cancelled
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

use super::application::{ExportField, JobApplication};

/// Lifecycle status of an export task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExportStatus {
    /// Terminal states are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExportStatus::Completed | ExportStatus::Failed | ExportStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: ExportStatus) -> bool {
        matches!(
            (self, next),
            (ExportStatus::Pending, ExportStatus::Running)
                | (ExportStatus::Pending, ExportStatus::Cancelled)
                | (ExportStatus::Running, ExportStatus::Completed)
                | (ExportStatus::Running, ExportStatus::Failed)
                | (ExportStatus::Running, ExportStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Pending => "pending",
            ExportStatus::Running => "running",
            ExportStatus::Completed => "completed",
            ExportStatus::Failed => "failed",
            ExportStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ExportStatus::Pending),
            "running" => Ok(ExportStatus::Running),
            "completed" => Ok(ExportStatus::Completed),
            "failed" => Ok(ExportStatus::Failed),
            "cancelled" => Ok(ExportStatus::Cancelled),
            _ => Err(format!("Unknown export status: {}", s)),
        }
    }
}

/// Output format of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Xlsx,
    Json,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 3] = [ExportFormat::Csv, ExportFormat::Xlsx, ExportFormat::Json];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
            ExportFormat::Json => "json",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            ExportFormat::Json => "application/json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "xlsx" => Ok(ExportFormat::Xlsx),
            "json" => Ok(ExportFormat::Json),
            _ => Err(format!("Unknown export format: {}", s)),
        }
    }
}

/// Filter parameters selected when an export is requested.
///
/// Immutable once stored on a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[validate(schema(function = "validate_filter_dates"))]
pub struct FilterSpec {
    /// Only applications in one of these statuses (empty = any).
    #[serde(default)]
    #[validate(custom(function = "validate_statuses"))]
    pub statuses: Vec<String>,

    /// Case-insensitive substring match on company.
    #[validate(custom(function = "shared::validation::validate_filter_text"))]
    pub company: Option<String>,

    /// Case-insensitive substring match on position.
    #[validate(custom(function = "shared::validation::validate_filter_text"))]
    pub position: Option<String>,

    pub applied_from: Option<DateTime<Utc>>,
    pub applied_to: Option<DateTime<Utc>>,

    /// Columns to export, in order (empty = every field).
    #[serde(default)]
    #[validate(custom(function = "validate_fields"))]
    pub fields: Vec<ExportField>,
}

/// Maximum number of status values in one filter.
pub const MAX_FILTER_STATUSES: usize = 20;

fn validate_filter_dates(spec: &FilterSpec) -> Result<(), validator::ValidationError> {
    shared::validation::validate_date_range(spec.applied_from, spec.applied_to)
}

fn validate_statuses(statuses: &[String]) -> Result<(), validator::ValidationError> {
    if statuses.len() > MAX_FILTER_STATUSES {
        let mut err = validator::ValidationError::new("too_many_statuses");
        err.message = Some(
            format!("At most {} statuses may be filtered", MAX_FILTER_STATUSES).into(),
        );
        return Err(err);
    }
    for status in statuses {
        shared::validation::validate_filter_text(status)?;
    }
    shared::validation::validate_unique(statuses)
}

fn validate_fields(fields: &[ExportField]) -> Result<(), validator::ValidationError> {
    shared::validation::validate_unique(fields)
}

impl FilterSpec {
    /// Columns this export writes.
    pub fn selected_fields(&self) -> Vec<ExportField> {
        if self.fields.is_empty() {
            ExportField::ALL.to_vec()
        } else {
            self.fields.clone()
        }
    }

    /// Whether an application passes this filter.
    pub fn matches(&self, application: &JobApplication) -> bool {
        if !self.statuses.is_empty()
            && !self
                .statuses
                .iter()
                .any(|s| s.eq_ignore_ascii_case(&application.status))
        {
            return false;
        }

        if let Some(ref company) = self.company {
            if !contains_ignore_case(&application.company, company) {
                return false;
            }
        }

        if let Some(ref position) = self.position {
            if !contains_ignore_case(&application.position, position) {
                return false;
            }
        }

        if self.applied_from.is_some() || self.applied_to.is_some() {
            let Some(applied_at) = application.applied_at else {
                return false;
            };
            if self.applied_from.is_some_and(|from| applied_at < from) {
                return false;
            }
            if self.applied_to.is_some_and(|to| applied_at > to) {
                return false;
            }
        }

        true
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// An export task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTask {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub filter_spec: FilterSpec,
    pub format: ExportFormat,
    pub status: ExportStatus,
    /// Rows written so far; non-decreasing while running.
    pub progress: i64,
    /// Row count estimate taken at admission.
    pub estimated_rows: Option<i64>,
    /// Final number of rows written, set on completion.
    pub row_count: Option<i64>,
    pub error_message: Option<String>,
    /// Stored artifact; present only while completed and not purged.
    pub artifact_ref: Option<String>,
    pub artifact_bytes: Option<i64>,
    pub artifact_sha256: Option<String>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub purged_at: Option<DateTime<Utc>>,
}

impl ExportTask {
    /// Build a fresh `Pending` task.
    pub fn new_pending(new: NewExportTask, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            owner_id: new.owner_id,
            filter_spec: new.filter_spec,
            format: new.format,
            status: ExportStatus::Pending,
            progress: 0,
            estimated_rows: None,
            row_count: None,
            error_message: None,
            artifact_ref: None,
            artifact_bytes: None,
            artifact_sha256: None,
            cancel_requested_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            expires_at: None,
            last_progress_at: None,
            purged_at: None,
        }
    }

    /// Completion percentage, when an estimate is known.
    pub fn progress_percent(&self) -> Option<u8> {
        if self.status == ExportStatus::Completed {
            return Some(100);
        }
        match self.estimated_rows {
            Some(total) if total > 0 => {
                let pct = (self.progress.max(0) * 100) / total;
                Some(pct.min(100) as u8)
            }
            Some(_) if self.status == ExportStatus::Running => Some(0),
            _ => None,
        }
    }

    /// A running task with no progress report within `threshold`.
    pub fn is_stalled(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.status != ExportStatus::Running {
            return false;
        }
        match self.last_progress_at.or(self.started_at) {
            Some(last) => now - last > threshold,
            None => false,
        }
    }

    /// Whether the artifact can currently be downloaded.
    pub fn is_downloadable(&self) -> bool {
        self.status == ExportStatus::Completed && self.artifact_ref.is_some()
    }
}

/// Data needed to create a task.
#[derive(Debug, Clone)]
pub struct NewExportTask {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub filter_spec: FilterSpec,
    pub format: ExportFormat,
}

impl NewExportTask {
    pub fn new(owner_id: Uuid, filter_spec: FilterSpec, format: ExportFormat) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            filter_spec,
            format,
        }
    }
}

/// Request payload for creating an export.
///
/// `format` stays a string here so an unsupported value surfaces as a
/// validation failure rather than a body deserialization error.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExportRequest {
    #[serde(default)]
    pub filter: FilterSpec,
    pub format: String,
}

/// Response payload for export creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExportResponse {
    pub task_id: Uuid,
    pub status: ExportStatus,
    pub created_at: DateTime<Utc>,
}

/// Task projection returned by status and history endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTaskResponse {
    pub task_id: Uuid,
    pub format: ExportFormat,
    pub status: ExportStatus,
    pub progress: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub downloadable: bool,
    pub cancel_requested: bool,
    pub stalled: bool,
    pub filter: FilterSpec,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_progress_at: Option<DateTime<Utc>>,
}

impl ExportTaskResponse {
    pub fn from_task(task: ExportTask, now: DateTime<Utc>, stall_threshold: Duration) -> Self {
        Self {
            progress_percent: task.progress_percent(),
            downloadable: task.is_downloadable(),
            cancel_requested: task.cancel_requested_at.is_some(),
            stalled: task.is_stalled(now, stall_threshold),
            task_id: task.id,
            format: task.format,
            status: task.status,
            progress: task.progress,
            row_count: task.row_count,
            error_message: task.error_message,
            filter: task.filter_spec,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            expires_at: task.expires_at,
            last_progress_at: task.last_progress_at,
        }
    }
}

/// Query parameters for export history.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportHistoryQuery {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
    /// Only honoured for administrators.
    pub owner: Option<Uuid>,
}

/// One page of export history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportHistoryResponse {
    pub data: Vec<ExportTaskResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Response for a cancellation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelExportResponse {
    pub task_id: Uuid,
    pub status: ExportStatus,
    pub cancel_requested: bool,
}

/// Supported format descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatInfo {
    pub format: ExportFormat,
    pub extension: String,
    pub content_type: String,
}

impl From<ExportFormat> for FormatInfo {
    fn from(format: ExportFormat) -> Self {
        Self {
            format,
            extension: format.extension().to_string(),
            content_type: format.content_type().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatsResponse {
    pub formats: Vec<FormatInfo>,
}

/// Exportable field descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    pub field: ExportField,
    pub header: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldsResponse {
    pub fields: Vec<FieldInfo>,
}

/// Query for the template endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateQuery {
    pub format: Option<String>,
}

/// One column of the export template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateColumn {
    pub field: ExportField,
    pub header: String,
    pub example: serde_json::Value,
}

/// Template describing the structure of an export file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateResponse {
    pub format: ExportFormat,
    pub content_type: String,
    pub columns: Vec<TemplateColumn>,
    pub example_request: serde_json::Value,
}

/// Default page size for export history.
pub const DEFAULT_HISTORY_LIMIT: i64 = 20;

/// Maximum page size for export history.
pub const MAX_HISTORY_LIMIT: i64 = 100;

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    fn application(status: &str, company: &str, applied_at: Option<DateTime<Utc>>) -> JobApplication {
        let now = Utc::now();
        JobApplication {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            company: company.to_string(),
            position: "Platform Engineer".to_string(),
            status: status.to_string(),
            location: None,
            salary_min: None,
            salary_max: None,
            source: None,
            job_url: None,
            notes: None,
            applied_at,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_status_transitions() {
        use ExportStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Pending.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn test_status_display_and_parse() {
        for status in [
            ExportStatus::Pending,
            ExportStatus::Running,
            ExportStatus::Completed,
            ExportStatus::Failed,
            ExportStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<ExportStatus>().unwrap(), status);
        }
        assert!("expired".parse::<ExportStatus>().is_err());
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("xlsx".parse::<ExportFormat>().unwrap(), ExportFormat::Xlsx);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("Z".parse::<ExportFormat>().is_err());
        assert!("".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_filter_validation_rejects_inverted_range() {
        let now = Utc::now();
        let spec = FilterSpec {
            applied_from: Some(now),
            applied_to: Some(now - Duration::days(1)),
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_filter_validation_rejects_duplicates_and_blank_text() {
        let dup_fields = FilterSpec {
            fields: vec![ExportField::Company, ExportField::Company],
            ..Default::default()
        };
        assert!(dup_fields.validate().is_err());

        let blank_company = FilterSpec {
            company: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(blank_company.validate().is_err());

        let dup_status = FilterSpec {
            statuses: vec!["applied".to_string(), "applied".to_string()],
            ..Default::default()
        };
        assert!(dup_status.validate().is_err());
    }

    #[test]
    fn test_filter_validation_accepts_default() {
        assert!(FilterSpec::default().validate().is_ok());
    }

    #[test]
    fn test_filter_rejects_unknown_keys() {
        let result: Result<FilterSpec, _> = serde_json::from_str(r#"{"colour":"blue"}"#);
        assert!(result.is_err());
        let result: Result<FilterSpec, _> = serde_json::from_str(r#"{"fields":["salary"]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_filter_matches() {
        let now = Utc::now();
        let spec = FilterSpec {
            statuses: vec!["Applied".to_string()],
            company: Some("acme".to_string()),
            applied_from: Some(now - Duration::days(2)),
            ..Default::default()
        };

        assert!(spec.matches(&application("applied", "ACME Corp", Some(now))));
        assert!(!spec.matches(&application("rejected", "ACME Corp", Some(now))));
        assert!(!spec.matches(&application("applied", "Globex", Some(now))));
        assert!(!spec.matches(&application("applied", "ACME Corp", None)));
        assert!(!spec.matches(&application(
            "applied",
            "ACME Corp",
            Some(now - Duration::days(3))
        )));
    }

    #[test]
    fn test_selected_fields_defaults_to_all() {
        assert_eq!(FilterSpec::default().selected_fields(), ExportField::ALL.to_vec());
        let spec = FilterSpec {
            fields: vec![ExportField::Notes],
            ..Default::default()
        };
        assert_eq!(spec.selected_fields(), vec![ExportField::Notes]);
    }

    #[test]
    fn test_progress_percent_and_staleness() {
        let now = Utc::now();
        let mut task = ExportTask::new_pending(
            NewExportTask::new(Uuid::new_v4(), FilterSpec::default(), ExportFormat::Csv),
            now,
        );
        assert_eq!(task.progress_percent(), None);
        assert!(!task.is_stalled(now, Duration::seconds(60)));

        task.status = ExportStatus::Running;
        task.started_at = Some(now - Duration::seconds(120));
        task.estimated_rows = Some(200);
        task.progress = 50;
        assert_eq!(task.progress_percent(), Some(25));
        assert!(task.is_stalled(now, Duration::seconds(60)));

        task.last_progress_at = Some(now - Duration::seconds(10));
        assert!(!task.is_stalled(now, Duration::seconds(60)));

        task.progress = 500;
        assert_eq!(task.progress_percent(), Some(100));
    }

    #[test]
    fn test_task_response_projection() {
        let now = Utc::now();
        let mut task = ExportTask::new_pending(
            NewExportTask::new(Uuid::new_v4(), FilterSpec::default(), ExportFormat::Json),
            now,
        );
        task.status = ExportStatus::Completed;
        task.artifact_ref = Some("x.json".to_string());
        task.row_count = Some(3);

        let response = ExportTaskResponse::from_task(task.clone(), now, Duration::seconds(60));
        assert_eq!(response.task_id, task.id);
        assert!(response.downloadable);
        assert_eq!(response.progress_percent, Some(100));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["rowCount"], 3);
        assert!(json.get("errorMessage").is_none());
    }
}
