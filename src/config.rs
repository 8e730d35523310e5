use serde::Deserialize;
use std::{fs, path::Path};

use crate::error::DecodeError;

/// Line format settings, fixed once streaming starts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Column separator.
    pub delimiter: String,
    /// Whether the first line is a header row.
    pub has_header: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            delimiter: ",".into(),
            has_header: true,
        }
    }
}

impl DecoderConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, DecodeError> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| DecodeError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub(crate) fn validate(&self) -> Result<(), DecodeError> {
        if self.delimiter.is_empty() {
            return Err(DecodeError::Configuration("delimiter must not be empty".into()));
        }
        Ok(())
    }
}
