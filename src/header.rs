use std::collections::BTreeMap;
use std::io::{self, BufRead};

use tracing::debug;

use crate::error::HeaderReadError;
use crate::field::FieldDescriptor;

/// Column position → index into the record's field descriptors.
///
/// Positions need not be contiguous; columns without an entry are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    columns: BTreeMap<usize, usize>,
}

impl ColumnMapping {
    pub fn get(&self, column: usize) -> Option<usize> {
        self.columns.get(&column).copied()
    }

    /// `(column, field index)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.columns.iter().map(|(c, f)| (*c, *f))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Match header labels against field tags.
pub fn map_header<S: AsRef<str>>(header: &[S], fields: &[FieldDescriptor]) -> ColumnMapping {
    let mut columns = BTreeMap::new();
    for (col, label) in header.iter().enumerate() {
        let label = label.as_ref();
        if let Some(idx) = fields.iter().position(|f| f.tag == Some(label)) {
            columns.insert(col, idx);
        }
    }
    ColumnMapping { columns }
}

/// Header and mapping for a source without a header row: tagged fields take
/// consecutive columns in declaration order.
pub fn synthesize_header(fields: &[FieldDescriptor]) -> (Vec<String>, ColumnMapping) {
    let mut header = Vec::new();
    let mut columns = BTreeMap::new();
    for (idx, fld) in fields.iter().enumerate() {
        if let Some(tag) = fld.tag.filter(|t| !t.is_empty()) {
            columns.insert(header.len(), idx);
            header.push(tag.to_string());
        }
    }
    (header, ColumnMapping { columns })
}

/// Read the first line of `reader` and split it into header labels.
pub fn read_header<R: BufRead>(
    reader: &mut R,
    delimiter: &str,
) -> Result<Vec<String>, HeaderReadError> {
    let mut buf = String::new();
    if !next_line(reader, &mut buf)? {
        return Err(HeaderReadError::Empty);
    }
    let header: Vec<String> = buf.split(delimiter).map(str::to_string).collect();
    debug!(columns = header.len(), "read csv header");
    Ok(header)
}

/// Read one line into `buf` without its `\n` / `\r\n` terminator, or a bare
/// `\r` on the last line.
/// Returns `false` at end of input.
pub(crate) fn next_line<R: BufRead>(reader: &mut R, buf: &mut String) -> io::Result<bool> {
    buf.clear();
    if reader.read_line(buf)? == 0 {
        return Ok(false);
    }
    if buf.ends_with('\n') {
        buf.pop();
    }
    if buf.ends_with('\r') {
        buf.pop();
    }
    Ok(true)
}
