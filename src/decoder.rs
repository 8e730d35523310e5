use std::io::{BufReader, Read};
use std::marker::PhantomData;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::config::DecoderConfig;
use crate::diagnostics::{Diagnostic, Diagnostics, TracingDiagnostics};
use crate::error::{DecodeError, HeaderReadError};
use crate::field::{self, FieldDescriptor, Record};
use crate::header::{map_header, next_line, read_header, synthesize_header, ColumnMapping};

/// Lifecycle of a decoder and the stream it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Unstarted,
    HeaderResolved,
    Streaming,
    Drained,
}

struct Resolved {
    header: Vec<String>,
    mapping: ColumnMapping,
}

/// Streams delimited lines from `R` into fresh `T` records.
pub struct Decoder<R, T> {
    reader: BufReader<R>,
    config: DecoderConfig,
    fields: &'static [FieldDescriptor],
    resolved: Option<Resolved>,
    /// Lines consumed so far, the header included.
    lines: usize,
    /// The header line was consumed but could not be read.
    header_failed: bool,
    diagnostics: Box<dyn Diagnostics>,
    _record: PhantomData<fn() -> T>,
}

impl<R, T> Decoder<R, T>
where
    R: Read + Send + 'static,
    T: Record,
{
    /// Decoder reporting per-row problems through `tracing`.
    pub fn new(reader: R) -> Result<Self, DecodeError> {
        Self::with_diagnostics(reader, TracingDiagnostics)
    }

    pub fn with_diagnostics(
        reader: R,
        diagnostics: impl Diagnostics,
    ) -> Result<Self, DecodeError> {
        let fields = T::fields();
        field::validate(fields)?;

        Ok(Self {
            reader: BufReader::new(reader),
            config: DecoderConfig::default(),
            fields,
            resolved: None,
            lines: 0,
            header_failed: false,
            diagnostics: Box::new(diagnostics),
            _record: PhantomData,
        })
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.config.delimiter = delimiter.into();
        self
    }

    pub fn has_header(mut self, has_header: bool) -> Self {
        self.config.has_header = has_header;
        self
    }

    pub fn config(mut self, config: DecoderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn state(&self) -> DecoderState {
        if self.resolved.is_some() {
            DecoderState::HeaderResolved
        } else {
            DecoderState::Unstarted
        }
    }

    pub fn lines_read(&self) -> usize {
        self.lines
    }

    pub fn fields(&self) -> &'static [FieldDescriptor] {
        self.fields
    }

    /// Header labels, once [`Decoder::mapping`] has run.
    pub fn header(&self) -> Option<&[String]> {
        self.resolved.as_ref().map(|r| r.header.as_slice())
    }

    /// Resolve the header against the record's tags.
    ///
    /// Reads the header line on first use; later calls return the cached
    /// mapping without touching the source. Configuration changes made after
    /// the first call do not re-resolve it. Once the header read has failed,
    /// every later call fails with [`HeaderReadError::Failed`].
    pub fn mapping(&mut self) -> Result<&ColumnMapping, DecodeError> {
        let resolved = match self.resolved.take() {
            Some(r) => r,
            None => self.resolve()?,
        };
        Ok(&self.resolved.insert(resolved).mapping)
    }

    fn resolve(&mut self) -> Result<Resolved, DecodeError> {
        if self.header_failed {
            return Err(HeaderReadError::Failed.into());
        }
        self.config.validate()?;

        let (header, mapping) = if self.config.has_header {
            let header = match read_header(&mut self.reader, &self.config.delimiter) {
                Ok(header) => header,
                Err(err) => {
                    if matches!(err, HeaderReadError::Io(_)) {
                        self.lines += 1;
                    }
                    self.header_failed = true;
                    return Err(err.into());
                }
            };
            self.lines += 1;
            let mapping = map_header(&header, self.fields);
            (header, mapping)
        } else {
            synthesize_header(self.fields)
        };

        let unmatched = header.len() - mapping.len();
        debug!(
            columns = header.len(),
            mapped = mapping.len(),
            unmatched,
            "resolved csv header"
        );
        Ok(Resolved { header, mapping })
    }

    /// Resolve the header and start streaming records.
    ///
    /// Errors only when the header cannot be resolved; per-row problems go to
    /// the diagnostics sink and the row is emitted anyway.
    #[instrument(level = "debug", skip(self), fields(record = std::any::type_name::<T>()))]
    pub fn unmarshal(mut self) -> Result<Records<T>, DecodeError> {
        self.mapping()?;

        let Decoder {
            reader,
            config,
            fields,
            resolved,
            lines,
            diagnostics,
            ..
        } = self;
        let mapping = resolved.map(|r| r.mapping).unwrap_or_default();

        let (tx, rx) = mpsc::channel(1);
        let producer = Producer {
            reader,
            delimiter: config.delimiter,
            fields,
            mapping,
            line: lines,
            diagnostics,
            tx,
        };

        let handle = thread::Builder::new()
            .name("csvstream-producer".into())
            .spawn(move || producer.run())
            .map_err(DecodeError::Spawn)?;

        info!("streaming started");
        Ok(Records {
            rx,
            producer: Some(handle),
            state: DecoderState::Streaming,
        })
    }
}

/// Owns the source once streaming has started.
struct Producer<R, T> {
    reader: BufReader<R>,
    delimiter: String,
    fields: &'static [FieldDescriptor],
    mapping: ColumnMapping,
    line: usize,
    diagnostics: Box<dyn Diagnostics>,
    tx: mpsc::Sender<T>,
}

impl<R: Read, T: Record> Producer<R, T> {
    fn run(mut self) {
        let mut buf = String::new();
        let mut emitted = 0u64;

        loop {
            if self.tx.is_closed() {
                debug!(line = self.line, "consumer closed the stream");
                break;
            }

            match next_line(&mut self.reader, &mut buf) {
                Ok(true) => {}
                Ok(false) => break,
                Err(error) => {
                    self.diagnostics.report(Diagnostic::Read {
                        line: self.line + 1,
                        error,
                    });
                    break;
                }
            }
            self.line += 1;

            let record = self.decode_row(&buf);
            if self.tx.blocking_send(record).is_err() {
                debug!(line = self.line, "consumer closed the stream");
                break;
            }
            emitted += 1;
        }

        debug!(emitted, lines = self.line, "producer finished");
    }

    fn decode_row(&mut self, line: &str) -> T {
        let columns: Vec<&str> = line.split(self.delimiter.as_str()).collect();
        let mut record = T::default();

        for (column, idx) in self.mapping.iter() {
            let field = self.fields[idx].name;
            let Some(raw) = columns.get(column) else {
                self.diagnostics.report(Diagnostic::MissingColumn {
                    line: self.line,
                    column,
                    field,
                });
                continue;
            };
            if let Err(error) = record.assign(idx, raw) {
                self.diagnostics.report(Diagnostic::Field {
                    line: self.line,
                    column,
                    field,
                    error,
                });
            }
        }

        record
    }
}

/// Handle over the decoded records, in source order.
///
/// The producer runs at most one record ahead of the consumer. Dropping the
/// handle or calling [`Records::cancel`] stops it before the next row.
pub struct Records<T> {
    rx: mpsc::Receiver<T>,
    producer: Option<JoinHandle<()>>,
    state: DecoderState,
}

impl<T> Records<T> {
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Async pull; `None` once the source is exhausted.
    pub async fn recv(&mut self) -> Option<T> {
        let next = self.rx.recv().await;
        if next.is_none() {
            self.state = DecoderState::Drained;
            self.producer.take();
        }
        next
    }

    /// Stop the producer. Records already handed off can still be received.
    pub fn cancel(&mut self) {
        self.rx.close();
    }

    pub fn into_stream(self) -> ReceiverStream<T> {
        ReceiverStream::new(self.rx)
    }
}

/// Blocking pull. Must not be driven from inside an async runtime thread;
/// use [`Records::recv`] or [`Records::into_stream`] there.
impl<T> Iterator for Records<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let next = self.rx.blocking_recv();
        if next.is_none() && self.state != DecoderState::Drained {
            self.state = DecoderState::Drained;
            if let Some(handle) = self.producer.take() {
                if handle.join().is_err() {
                    warn!("producer thread panicked");
                }
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectDiagnostics;
    use crate::error::CoerceError;
    use crate::field::FieldKind;
    use anyhow::{Context, Result};
    use futures::StreamExt;
    use std::fs::File;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    fn init_tracing() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("info,csvstream=debug")),
            )
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    crate::csv_record! {
        #[derive(Debug, Default, Clone, PartialEq)]
        struct Quote {
            #[csv = "timestamp"]
            timestamp: String,
            #[csv = "open"]
            open: f64,
        }
    }

    crate::csv_record! {
        #[derive(Debug, Default, Clone, PartialEq)]
        struct Timeseries {
            #[csv = "timestamp"]
            time_stamp: String,
            symbol: String,
            #[csv = "open"]
            open: f64,
            #[csv = "close"]
            close: f64,
            #[csv = "volume"]
            volume: i64,
            #[csv = "trades"]
            trades: u32,
        }
    }

    fn source(text: &str) -> Cursor<Vec<u8>> {
        Cursor::new(text.as_bytes().to_vec())
    }

    #[test]
    fn bad_cell_keeps_row_and_reports_line() -> Result<()> {
        init_tracing();
        let sink = CollectDiagnostics::new();
        let src = source("timestamp,open\n2020-01-01,100.5\n2020-01-02,bad\n");

        let rows: Vec<Quote> = Decoder::with_diagnostics(src, sink.clone())?
            .unmarshal()?
            .collect();

        assert_eq!(
            rows,
            [
                Quote { timestamp: "2020-01-01".into(), open: 100.5 },
                Quote { timestamp: "2020-01-02".into(), open: 0.0 },
            ]
        );

        let diags = sink.take();
        assert_eq!(diags.len(), 1);
        match &diags[0] {
            Diagnostic::Field { line, column, field, error } => {
                assert_eq!(*line, 3);
                assert_eq!(*column, 1);
                assert_eq!(*field, "open");
                assert!(matches!(
                    error,
                    CoerceError::Coercion { kind: FieldKind::Float, raw, .. } if raw == "bad"
                ));
            }
            other => panic!("unexpected diagnostic: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn empty_source_fails_before_streaming() {
        let err = Decoder::<_, Quote>::new(source(""))
            .and_then(Decoder::unmarshal)
            .err()
            .expect("empty source must not stream");
        assert!(matches!(
            err,
            DecodeError::HeaderRead { source: HeaderReadError::Empty }
        ));
    }

    #[test]
    fn failed_header_is_not_retried_on_the_next_line() -> Result<()> {
        let mut bytes = vec![0xff, 0xfe, b'\n'];
        bytes.extend_from_slice(b"timestamp,open\n2020-01-01,1\n");
        let mut dec = Decoder::<_, Quote>::new(Cursor::new(bytes))?;

        assert!(matches!(
            dec.mapping(),
            Err(DecodeError::HeaderRead { source: HeaderReadError::Io(_) })
        ));
        assert_eq!(dec.lines_read(), 1);

        assert!(matches!(
            dec.mapping(),
            Err(DecodeError::HeaderRead { source: HeaderReadError::Failed })
        ));
        assert_eq!(dec.lines_read(), 1);
        assert_eq!(dec.state(), DecoderState::Unstarted);
        assert!(dec.header().is_none());

        assert!(matches!(
            dec.unmarshal(),
            Err(DecodeError::HeaderRead { source: HeaderReadError::Failed })
        ));
        Ok(())
    }

    #[test]
    fn crlf_file_with_bare_cr_on_last_line() -> Result<()> {
        let sink = CollectDiagnostics::new();
        let src = source("timestamp,open\r\n2020-01-01,1.5\r\n2020-01-02,2.5\r");
        let rows: Vec<Quote> = Decoder::with_diagnostics(src, sink.clone())?
            .unmarshal()?
            .collect();

        assert_eq!(
            rows,
            [
                Quote { timestamp: "2020-01-01".into(), open: 1.5 },
                Quote { timestamp: "2020-01-02".into(), open: 2.5 },
            ]
        );
        assert!(sink.is_empty());
        Ok(())
    }

    #[test]
    fn integer_and_unsupported_failures_still_emit_rows() -> Result<()> {
        crate::csv_record! {
            #[derive(Debug, Default, Clone, PartialEq)]
            struct Tick {
                #[csv = "volume"]
                volume: i64,
                #[csv = "trades"]
                trades: u64,
                #[csv = "lots"]
                lots: u8,
                #[csv = "halted"]
                halted: bool,
                #[csv = "symbol"]
                symbol: String,
            }
        }

        let sink = CollectDiagnostics::new();
        let text = "volume,trades,lots,halted,symbol\n\
                    1.5,-2,300,true,IBM\n\
                    10,20,30,false,AAPL\n";
        let rows: Vec<Tick> = Decoder::with_diagnostics(source(text), sink.clone())?
            .unmarshal()?
            .collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            Tick { symbol: "IBM".into(), ..Tick::default() }
        );
        assert_eq!((rows[1].volume, rows[1].trades, rows[1].lots), (10, 20, 30));
        assert!(!rows[1].halted);

        let got: Vec<_> = sink
            .take()
            .into_iter()
            .map(|d| match d {
                Diagnostic::Field { line, field, error, .. } => (line, field, error),
                other => panic!("unexpected diagnostic: {other:?}"),
            })
            .collect();
        assert_eq!(got.len(), 5);

        let (line, field, error) = &got[0];
        assert_eq!((*line, *field), (2, "volume"));
        assert!(matches!(error, CoerceError::Coercion { kind: FieldKind::Int, raw, .. } if raw == "1.5"));

        let (line, field, error) = &got[1];
        assert_eq!((*line, *field), (2, "trades"));
        assert!(matches!(error, CoerceError::Coercion { kind: FieldKind::Uint, raw, .. } if raw == "-2"));

        let (line, field, error) = &got[2];
        assert_eq!((*line, *field), (2, "lots"));
        assert!(matches!(error, CoerceError::Coercion { kind: FieldKind::Uint, raw, .. } if raw == "300"));

        for (i, (line, field, error)) in got[3..].iter().enumerate() {
            assert_eq!((*line, *field), (i + 2, "halted"));
            assert_eq!(*error, CoerceError::UnsupportedType { type_name: "bool" });
        }
        Ok(())
    }

    #[test]
    fn header_only_source_yields_nothing() -> Result<()> {
        let mut records = Decoder::<_, Quote>::new(source("timestamp,open\n"))?.unmarshal()?;
        assert_eq!(records.state(), DecoderState::Streaming);
        assert!(records.next().is_none());
        assert_eq!(records.state(), DecoderState::Drained);
        Ok(())
    }

    #[test]
    fn columns_map_by_label_not_position() -> Result<()> {
        let text = "volume;extra;close;timestamp;open;trades\n\
                    1200;x;10.5;2020-01-01;10.0;7\n\
                    -3;y;11.25;2020-01-02;10.5;8\n";
        let rows: Vec<Timeseries> = Decoder::new(source(text))?.delimiter(";").unmarshal()?.collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            Timeseries {
                time_stamp: "2020-01-01".into(),
                symbol: String::new(),
                open: 10.0,
                close: 10.5,
                volume: 1200,
                trades: 7,
            }
        );
        assert_eq!(rows[1].volume, -3);
        assert_eq!(rows[1].close, 11.25);
        Ok(())
    }

    #[test]
    fn headerless_source_uses_tag_order() -> Result<()> {
        let sink = CollectDiagnostics::new();
        let text = "2020-01-01,1.5,2.5,10,3\n2020-01-02,1.75,2.75,20,4\n";
        let mut dec = Decoder::<_, Timeseries>::with_diagnostics(source(text), sink.clone())?
            .has_header(false);

        assert_eq!(dec.mapping()?.iter().collect::<Vec<_>>(), [(0, 0), (1, 2), (2, 3), (3, 4), (4, 5)]);
        assert_eq!(
            dec.header(),
            Some(&["timestamp", "open", "close", "volume", "trades"].map(String::from)[..])
        );
        assert_eq!(dec.lines_read(), 0);

        let rows: Vec<_> = dec.unmarshal()?.collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].time_stamp, "2020-01-02");
        assert_eq!(rows[1].open, 1.75);
        assert_eq!(rows[1].trades, 4);
        assert!(sink.is_empty());
        Ok(())
    }

    #[test]
    fn header_resolution_happens_once() -> Result<()> {
        let mut dec = Decoder::<_, Quote>::new(source("timestamp,open\n2020-01-01,1\n"))?;
        assert_eq!(dec.state(), DecoderState::Unstarted);

        let first = dec.mapping()?.clone();
        assert_eq!(dec.lines_read(), 1);
        let second = dec.mapping()?.clone();
        assert_eq!(first, second);
        assert_eq!(dec.lines_read(), 1);
        assert_eq!(dec.state(), DecoderState::HeaderResolved);
        assert_eq!(dec.header(), Some(&["timestamp".to_string(), "open".to_string()][..]));

        let rows: Vec<_> = dec.unmarshal()?.collect();
        assert_eq!(rows, [Quote { timestamp: "2020-01-01".into(), open: 1.0 }]);
        Ok(())
    }

    #[test]
    fn short_rows_report_missing_columns() -> Result<()> {
        let sink = CollectDiagnostics::new();
        let text = "timestamp,open\n2020-01-01\n\n2020-01-03,3\n";
        let rows: Vec<Quote> = Decoder::with_diagnostics(source(text), sink.clone())?
            .unmarshal()?
            .collect();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].timestamp, "2020-01-01");
        assert_eq!(rows[1], Quote::default());
        assert_eq!(rows[2].open, 3.0);

        let missing: Vec<_> = sink
            .take()
            .into_iter()
            .map(|d| match d {
                Diagnostic::MissingColumn { line, field, .. } => (line, field),
                other => panic!("unexpected diagnostic: {other:?}"),
            })
            .collect();
        assert_eq!(missing, [(2, "open"), (3, "open")]);
        Ok(())
    }

    #[test]
    fn record_count_matches_data_lines() -> Result<()> {
        let mut text = String::from("timestamp,open\r\n");
        for i in 0..500 {
            text.push_str(&format!("t{i},{i}.5\r\n"));
        }
        let rows: Vec<Quote> = Decoder::new(source(&text))?.unmarshal()?.collect();

        assert_eq!(rows.len(), 500);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.timestamp, format!("t{i}"));
            assert_eq!(row.open, i as f64 + 0.5);
        }
        Ok(())
    }

    #[test]
    fn duplicate_tags_are_rejected() {
        crate::csv_record! {
            #[derive(Debug, Default)]
            struct Twice {
                #[csv = "open"]
                a: f64,
                #[csv = "open"]
                b: f64,
            }
        }
        let res = Decoder::<_, Twice>::new(source("open\n1\n"));
        assert!(matches!(res, Err(DecodeError::Configuration(_))));
    }

    #[test]
    fn empty_delimiter_is_rejected_at_unmarshal() -> Result<()> {
        let res = Decoder::<_, Quote>::new(source("timestamp,open\n"))?
            .delimiter("")
            .unmarshal();
        assert!(matches!(res, Err(DecodeError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn read_error_ends_stream_with_diagnostic() -> Result<()> {
        let sink = CollectDiagnostics::new();
        let mut bytes = b"timestamp,open\n2020-01-01,1\n".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, b'\n']);
        bytes.extend_from_slice(b"2020-01-03,3\n");

        let rows: Vec<Quote> = Decoder::with_diagnostics(Cursor::new(bytes), sink.clone())?
            .unmarshal()?
            .collect();

        assert_eq!(rows.len(), 1);
        let diags = sink.take();
        assert_eq!(diags.len(), 1);
        assert!(matches!(diags[0], Diagnostic::Read { line: 3, .. }));
        Ok(())
    }

    #[test]
    fn cancel_stops_the_producer() -> Result<()> {
        let mut text = String::from("timestamp,open\n");
        for i in 0..10_000 {
            text.push_str(&format!("t{i},{i}\n"));
        }
        let mut records = Decoder::<_, Quote>::new(source(&text))?.unmarshal()?;

        assert_eq!(records.next().context("first row")?.timestamp, "t0");
        assert_eq!(records.next().context("second row")?.timestamp, "t1");
        records.cancel();

        let rest: Vec<_> = records.by_ref().collect();
        assert!(rest.len() <= 1, "got {} rows after cancel", rest.len());
        assert_eq!(records.state(), DecoderState::Drained);
        Ok(())
    }

    #[test]
    fn decodes_from_a_file() -> Result<()> {
        init_tracing();
        let mut tmp = NamedTempFile::new()?;
        write!(
            tmp,
            "timestamp,open,high,low,close,adjusted_close,volume,dividend_amount,split_coefficient\n\
             2020-04-09,268.7,270.07,264.7,267.99,267.99,40529123,0.0000,1.0\n\
             2020-04-08,262.74,267.37,261.23,266.07,266.07,42223821,0.0000,1.0\n"
        )?;

        let file = File::open(tmp.path())?;
        let rows: Vec<Timeseries> = Decoder::new(file)?.unmarshal()?.collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].time_stamp, "2020-04-09");
        assert_eq!(rows[0].close, 267.99);
        assert_eq!(rows[1].volume, 42223821);
        assert_eq!(rows[1].trades, 0);
        Ok(())
    }

    #[tokio::test]
    async fn async_consumers_see_the_same_rows() -> Result<()> {
        let text = "timestamp,open\na,1\nb,2\nc,3\n";

        let mut records = Decoder::<_, Quote>::new(source(text))?.unmarshal()?;
        let mut pulled = Vec::new();
        while let Some(row) = records.recv().await {
            pulled.push(row);
        }
        assert_eq!(records.state(), DecoderState::Drained);

        let streamed: Vec<Quote> = Decoder::new(source(text))?
            .unmarshal()?
            .into_stream()
            .collect()
            .await;

        assert_eq!(pulled, streamed);
        assert_eq!(
            streamed.iter().map(|q| q.open).collect::<Vec<_>>(),
            [1.0, 2.0, 3.0]
        );
        Ok(())
    }
}
