use std::io;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::warn;

use crate::error::CoerceError;

/// A per-row problem. Rows are still emitted when one of these occurs.
#[derive(Debug, Error)]
pub enum Diagnostic {
    #[error("line:{line} field:{field}: {error}")]
    Field {
        line: usize,
        column: usize,
        field: &'static str,
        #[source]
        error: CoerceError,
    },

    #[error("line:{line} field:{field}: row has no column {column}")]
    MissingColumn {
        line: usize,
        column: usize,
        field: &'static str,
    },

    /// The source failed mid-stream; no further rows follow.
    #[error("line:{line}: read failed: {error}")]
    Read {
        line: usize,
        #[source]
        error: io::Error,
    },
}

impl Diagnostic {
    pub fn line(&self) -> usize {
        match self {
            Diagnostic::Field { line, .. }
            | Diagnostic::MissingColumn { line, .. }
            | Diagnostic::Read { line, .. } => *line,
        }
    }

    /// Name of the affected field, if the problem is tied to one.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Diagnostic::Field { field, .. } | Diagnostic::MissingColumn { field, .. } => {
                Some(field)
            }
            Diagnostic::Read { .. } => None,
        }
    }
}

/// Receives per-row problems from the producer thread.
pub trait Diagnostics: Send + 'static {
    fn report(&mut self, diagnostic: Diagnostic);
}

impl<F> Diagnostics for F
where
    F: FnMut(Diagnostic) + Send + 'static,
{
    fn report(&mut self, diagnostic: Diagnostic) {
        self(diagnostic)
    }
}

/// Default sink: one `warn!` event per diagnostic.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn report(&mut self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::Field {
                line,
                column,
                field,
                error,
            } => warn!(line, column, field, %error, "failed to decode column"),
            Diagnostic::MissingColumn {
                line,
                column,
                field,
            } => warn!(line, column, field, "row is missing column"),
            Diagnostic::Read { line, error } => warn!(line, %error, "read failed, stopping"),
        }
    }
}

/// Keeps every diagnostic in memory; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct CollectDiagnostics {
    inner: Arc<Mutex<Vec<Diagnostic>>>,
}

impl CollectDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything collected so far.
    pub fn take(&self) -> Vec<Diagnostic> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *inner)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Diagnostics for CollectDiagnostics {
    fn report(&mut self, diagnostic: Diagnostic) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(diagnostic);
    }
}
