//! Delimited text writer.

use std::io::Write;

use domain::models::{Cell, ExportField};

use super::{FormatWriter, WriteReceipt, WriterError, WriterState};

/// UTF-8 byte order mark; spreadsheet tools use it to detect the encoding.
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Writes RFC 4180 CSV with a UTF-8 BOM.
pub struct CsvExportWriter<W: Write> {
    inner: csv::Writer<W>,
    state: WriterState,
}

impl<W: Write> CsvExportWriter<W> {
    pub fn new(mut sink: W) -> Result<Self, WriterError> {
        sink.write_all(UTF8_BOM)?;
        Ok(Self {
            inner: csv::WriterBuilder::new()
                .terminator(csv::Terminator::CRLF)
                .from_writer(sink),
            state: WriterState::default(),
        })
    }

    pub fn get_ref(&self) -> &W {
        self.inner.get_ref()
    }
}

impl<W: Write + Send> FormatWriter for CsvExportWriter<W> {
    fn write_header(&mut self, fields: &[ExportField]) -> Result<(), WriterError> {
        self.state.begin_header(fields.len())?;
        self.inner.write_record(fields.iter().map(|f| f.header()))?;
        Ok(())
    }

    fn write_row(&mut self, row: &[Cell]) -> Result<(), WriterError> {
        self.state.begin_row(row.len())?;
        self.inner.write_record(row.iter().map(Cell::to_text))?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<WriteReceipt, WriterError> {
        let receipt = self.state.begin_finalize()?;
        self.inner.flush()?;
        Ok(receipt)
    }
}
