//! Office Open XML workbook writer.
//!
//! Produces a single-sheet workbook with inline strings, so no shared
//! string table has to be held in memory. The sheet part is streamed into
//! the archive row by row; the fixed package parts are written up front.

use std::io::{Seek, Write};

use domain::models::{Cell, ExportField};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{FormatWriter, WriteReceipt, WriterError, WriterState};

const SHEET_NAME: &str = "Applications";

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

const SHEET_OPEN: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#;

const SHEET_CLOSE: &str = "</sheetData></worksheet>";

/// Streams rows into an `.xlsx` package.
pub struct XlsxExportWriter<W: Write + Seek> {
    zip: Option<ZipWriter<W>>,
    finished: Option<W>,
    state: WriterState,
    next_row: usize,
}

impl<W: Write + Seek> XlsxExportWriter<W> {
    pub fn new(sink: W) -> Result<Self, WriterError> {
        let options = Self::options();
        let mut zip = ZipWriter::new(sink);

        zip.start_file("[Content_Types].xml", options)?;
        zip.write_all(CONTENT_TYPES.as_bytes())?;
        zip.start_file("_rels/.rels", options)?;
        zip.write_all(ROOT_RELS.as_bytes())?;
        zip.start_file("xl/workbook.xml", options)?;
        zip.write_all(workbook_xml().as_bytes())?;
        zip.start_file("xl/_rels/workbook.xml.rels", options)?;
        zip.write_all(WORKBOOK_RELS.as_bytes())?;

        zip.start_file("xl/worksheets/sheet1.xml", options)?;
        zip.write_all(SHEET_OPEN.as_bytes())?;

        Ok(Self {
            zip: Some(zip),
            finished: None,
            state: WriterState::default(),
            next_row: 1,
        })
    }

    /// The underlying sink, available once the package is finalized.
    pub fn finished_sink(&self) -> Option<&W> {
        self.finished.as_ref()
    }

    fn options() -> SimpleFileOptions {
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
    }

    fn sheet(&mut self) -> Result<&mut ZipWriter<W>, WriterError> {
        self.zip.as_mut().ok_or(WriterError::AlreadyFinalized)
    }

    fn write_sheet_row<'a>(
        &mut self,
        cells: impl Iterator<Item = &'a Cell>,
    ) -> Result<(), WriterError> {
        let row_number = self.next_row;
        self.next_row += 1;

        let mut xml = format!(r#"<row r="{}">"#, row_number);
        for (index, cell) in cells.enumerate() {
            push_cell(&mut xml, &cell_ref(index, row_number), cell);
        }
        xml.push_str("</row>");

        self.sheet()?.write_all(xml.as_bytes())?;
        Ok(())
    }
}

impl<W: Write + Seek + Send> FormatWriter for XlsxExportWriter<W> {
    fn write_header(&mut self, fields: &[ExportField]) -> Result<(), WriterError> {
        self.state.begin_header(fields.len())?;
        let headers: Vec<Cell> = fields
            .iter()
            .map(|f| Cell::Text(f.header().to_string()))
            .collect();
        self.write_sheet_row(headers.iter())
    }

    fn write_row(&mut self, row: &[Cell]) -> Result<(), WriterError> {
        self.state.begin_row(row.len())?;
        self.write_sheet_row(row.iter())
    }

    fn finalize(&mut self) -> Result<WriteReceipt, WriterError> {
        let receipt = self.state.begin_finalize()?;
        let mut zip = self.zip.take().ok_or(WriterError::AlreadyFinalized)?;
        zip.write_all(SHEET_CLOSE.as_bytes())?;
        let mut sink = zip.finish()?;
        sink.flush()?;
        self.finished = Some(sink);
        Ok(receipt)
    }
}

fn workbook_xml() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        SHEET_NAME
    )
}

/// Spreadsheet column letters for a zero-based index (0 -> A, 26 -> AA).
fn column_name(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

fn cell_ref(column: usize, row: usize) -> String {
    format!("{}{}", column_name(column), row)
}

fn push_cell(xml: &mut String, reference: &str, cell: &Cell) {
    match cell {
        Cell::Empty => {}
        Cell::Integer(n) => {
            xml.push_str(&format!(r#"<c r="{}"><v>{}</v></c>"#, reference, n));
        }
        Cell::Text(_) | Cell::Timestamp(_) => {
            xml.push_str(&format!(
                r#"<c r="{}" t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                reference,
                escape_xml(&cell.to_text())
            ));
        }
    }
}

/// Escape markup characters and drop code points XML 1.0 cannot carry.
fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\t' | '\n' | '\r' => escaped.push(c),
            c if (c as u32) < 0x20 => {}
            '\u{FFFE}' | '\u{FFFF}' => {}
            c => escaped.push(c),
        }
    }
    escaped
}
