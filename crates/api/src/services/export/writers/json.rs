//! JSON array writer.

use std::io::Write;

use domain::models::{Cell, ExportField};

use super::{FormatWriter, WriteReceipt, WriterError, WriterState};

/// Writes a JSON array with one object per row, keyed by field name.
///
/// The array is assembled by hand so each row is serialized and written as
/// soon as it arrives.
pub struct JsonExportWriter<W: Write> {
    sink: W,
    keys: Vec<&'static str>,
    state: WriterState,
}

impl<W: Write> JsonExportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            keys: Vec::new(),
            state: WriterState::default(),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }
}

impl<W: Write + Send> FormatWriter for JsonExportWriter<W> {
    fn write_header(&mut self, fields: &[ExportField]) -> Result<(), WriterError> {
        self.state.begin_header(fields.len())?;
        self.keys = fields.iter().map(|f| f.key()).collect();
        self.sink.write_all(b"[")?;
        Ok(())
    }

    fn write_row(&mut self, row: &[Cell]) -> Result<(), WriterError> {
        self.state.begin_row(row.len())?;

        let object: serde_json::Map<String, serde_json::Value> = self
            .keys
            .iter()
            .zip(row)
            .map(|(key, cell)| (key.to_string(), cell.to_json()))
            .collect();

        if self.state.rows() > 1 {
            self.sink.write_all(b",")?;
        }
        self.sink.write_all(b"\n")?;
        serde_json::to_writer(&mut self.sink, &object)?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<WriteReceipt, WriterError> {
        let receipt = self.state.begin_finalize()?;
        if receipt.rows > 0 {
            self.sink.write_all(b"\n")?;
        }
        self.sink.write_all(b"]\n")?;
        self.sink.flush()?;
        Ok(receipt)
    }
}
