//! Domain models for JobTrack exports.

pub mod application;
pub mod export_task;

pub use application::{Cell, ExportField, JobApplication, RecordCursor};
pub use export_task::{
    CancelExportResponse, CreateExportRequest, CreateExportResponse, ExportFormat,
    ExportHistoryQuery, ExportHistoryResponse, ExportStatus, ExportTask, ExportTaskResponse,
    FieldInfo, FieldsResponse, FilterSpec, FormatInfo, FormatsResponse, NewExportTask,
    TemplateColumn, TemplateQuery, TemplateResponse, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT,
};
