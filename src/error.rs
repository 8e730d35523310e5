use std::io;

use thiserror::Error;

use crate::field::FieldKind;

/// Errors that stop a decoder from producing a stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The record type's descriptor table or the decoder configuration is unusable.
    #[error("invalid decoder configuration: {0}")]
    Configuration(String),

    /// The header line could not be read.
    #[error("failed to get header from csv")]
    HeaderRead {
        #[from]
        source: HeaderReadError,
    },

    #[error("failed to start producer thread")]
    Spawn(#[source] io::Error),

    #[error("failed to read decoder config `{path}`")]
    ConfigRead {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse decoder config")]
    ConfigParse(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum HeaderReadError {
    #[error("source is empty")]
    Empty,
    /// An earlier attempt already consumed the header line and failed.
    #[error("header read failed earlier")]
    Failed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A single column that could not be converted into its field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoerceError {
    #[error("failed to convert {raw:?} to {kind}: {reason}")]
    Coercion {
        kind: FieldKind,
        raw: String,
        reason: String,
    },

    #[error("no conversion rule for field type `{type_name}`")]
    UnsupportedType { type_name: &'static str },
}

impl CoerceError {
    pub(crate) fn coercion(kind: FieldKind, raw: &str, reason: impl ToString) -> Self {
        CoerceError::Coercion {
            kind,
            raw: raw.to_string(),
            reason: reason.to_string(),
        }
    }
}
