//! Format writers.
//!
//! A writer turns a header plus a stream of rows into one output file.
//! Rows arrive a batch at a time and are written straight through to the
//! sink, so memory use does not grow with the export size.

mod csv;
mod json;
mod xlsx;

pub use self::csv::CsvExportWriter;
pub use self::json::JsonExportWriter;
pub use self::xlsx::XlsxExportWriter;

use domain::models::{Cell, ExportField, ExportFormat};
use std::fs::File;
use std::io::BufWriter;
use thiserror::Error;

/// Format writer errors.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV encoding error: {0}")]
    Csv(#[from] ::csv::Error),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Workbook encoding error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Header must be written exactly once, before any row")]
    HeaderOrder,

    #[error("Row has {actual} cells, header has {expected}")]
    RowWidth { expected: usize, actual: usize },

    #[error("Writer already finalized")]
    AlreadyFinalized,
}

/// Summary returned by a successful `finalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub rows: i64,
}

/// Incremental encoder for one export file.
///
/// Call order: `write_header` once, `write_row` any number of times, then
/// `finalize` once. Any further call after `finalize` returns
/// `WriterError::AlreadyFinalized`.
pub trait FormatWriter: Send {
    fn write_header(&mut self, fields: &[ExportField]) -> Result<(), WriterError>;

    fn write_row(&mut self, row: &[Cell]) -> Result<(), WriterError>;

    /// Flush all buffered output to the sink.
    fn finalize(&mut self) -> Result<WriteReceipt, WriterError>;
}

/// Build the writer for `format` over a staged file.
pub fn writer_for(format: ExportFormat, file: File) -> Result<Box<dyn FormatWriter>, WriterError> {
    let sink = BufWriter::new(file);
    Ok(match format {
        ExportFormat::Csv => Box::new(CsvExportWriter::new(sink)?),
        ExportFormat::Xlsx => Box::new(XlsxExportWriter::new(sink)?),
        ExportFormat::Json => Box::new(JsonExportWriter::new(sink)),
    })
}

/// Tracks call order shared by every writer.
#[derive(Debug, Default)]
pub(crate) struct WriterState {
    columns: Option<usize>,
    rows: i64,
    finalized: bool,
}

impl WriterState {
    pub(crate) fn begin_header(&mut self, columns: usize) -> Result<(), WriterError> {
        self.ensure_open()?;
        if self.columns.is_some() {
            return Err(WriterError::HeaderOrder);
        }
        self.columns = Some(columns);
        Ok(())
    }

    pub(crate) fn begin_row(&mut self, width: usize) -> Result<(), WriterError> {
        self.ensure_open()?;
        let expected = self.columns.ok_or(WriterError::HeaderOrder)?;
        if expected != width {
            return Err(WriterError::RowWidth {
                expected,
                actual: width,
            });
        }
        self.rows += 1;
        Ok(())
    }

    /// Marks the writer finalized; a second call fails.
    pub(crate) fn begin_finalize(&mut self) -> Result<WriteReceipt, WriterError> {
        self.ensure_open()?;
        if self.columns.is_none() {
            return Err(WriterError::HeaderOrder);
        }
        self.finalized = true;
        Ok(WriteReceipt { rows: self.rows })
    }

    pub(crate) fn rows(&self) -> i64 {
        self.rows
    }

    fn ensure_open(&self) -> Result<(), WriterError> {
        if self.finalized {
            return Err(WriterError::AlreadyFinalized);
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_enforces_call_order() {
        let mut state = WriterState::default();
        assert!(matches!(state.begin_row(1), Err(WriterError::HeaderOrder)));
        state.begin_header(2).unwrap();
        assert!(matches!(state.begin_header(2), Err(WriterError::HeaderOrder)));
        assert!(matches!(
            state.begin_row(3),
            Err(WriterError::RowWidth {
                expected: 2,
                actual: 3
            })
        ));
        state.begin_row(2).unwrap();
        assert_eq!(state.begin_finalize().unwrap().rows, 1);
        assert!(matches!(
            state.begin_finalize(),
            Err(WriterError::AlreadyFinalized)
        ));
        assert!(matches!(state.begin_row(2), Err(WriterError::AlreadyFinalized)));
    }

    #[test]
    fn test_writer_for_every_format() {
        for format in ExportFormat::ALL {
            let file = tempfile::tempfile().unwrap();
            let mut writer = writer_for(format, file).unwrap();
            writer.write_header(&test_support::fields()).unwrap();
            writer.write_row(&test_support::row("Acme", Some(1))).unwrap();
            assert_eq!(writer.finalize().unwrap().rows, 1);
            assert!(matches!(
                writer.finalize(),
                Err(WriterError::AlreadyFinalized)
            ));
        }
    }
}
