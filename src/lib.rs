//! Stream delimited text into typed records, one line at a time.
//!
//! Columns are bound to struct fields by tag. Declare the record with
//! [`csv_record!`], build a [`Decoder`] over any reader and pull records from
//! the [`Records`] handle it returns:
//!
//! ```
//! use csvstream::{csv_record, Decoder};
//!
//! csv_record! {
//!     #[derive(Debug, Default)]
//!     pub struct Quote {
//!         #[csv = "timestamp"]
//!         pub timestamp: String,
//!         #[csv = "open"]
//!         pub open: f64,
//!     }
//! }
//!
//! let src = std::io::Cursor::new("timestamp,open\n2020-01-01,100.5\n");
//! let rows: Vec<Quote> = Decoder::new(src)?.unmarshal()?.collect();
//! assert_eq!(rows[0].open, 100.5);
//! # Ok::<(), csvstream::DecodeError>(())
//! ```
//!
//! Cells that fail to convert do not stop the stream: the row is emitted with
//! that field left at its default and the problem goes to the decoder's
//! [`Diagnostics`] sink.

pub mod coerce;
pub mod config;
pub mod decoder;
pub mod diagnostics;
pub mod error;
pub mod field;
pub mod header;

pub use coerce::{coerce, Value};
pub use config::DecoderConfig;
pub use decoder::{Decoder, DecoderState, Records};
pub use diagnostics::{CollectDiagnostics, Diagnostic, Diagnostics, TracingDiagnostics};
pub use error::{CoerceError, DecodeError, HeaderReadError};
pub use field::{Column, FieldDescriptor, FieldKind, Record};
pub use header::ColumnMapping;
