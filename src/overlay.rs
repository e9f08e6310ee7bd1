//! Deep-merge of structured configuration documents.
//!
//! Merge rules, identical for JSON and TOML:
//!
//! - tables/objects merge key-wise, recursing into keys present on both sides;
//! - any other value on the override side replaces the base value, so leaf
//!   conflicts resolve to the override and arrays are replaced wholesale;
//! - keys only present in the base are kept untouched.

use ortho_config::toml;
use thiserror::Error;

/// Errors raised while merging serialized documents.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OverlayError {
    /// Raised when the base document cannot be decoded.
    #[error("failed to parse base {format} document: {message}")]
    Base {
        /// Document format (`toml` or `json`).
        format: &'static str,
        /// Parser message.
        message: String,
    },
    /// Raised when the override document cannot be decoded.
    #[error("failed to parse override {format} document: {message}")]
    Override {
        /// Document format (`toml` or `json`).
        format: &'static str,
        /// Parser message.
        message: String,
    },
    /// Raised when the merged document cannot be encoded again.
    #[error("failed to encode merged {format} document: {message}")]
    Encode {
        /// Document format (`toml` or `json`).
        format: &'static str,
        /// Encoder message.
        message: String,
    },
}

/// A document that can absorb an override document.
pub trait Overlay {
    /// Merges `other` into `self`, with `other` winning on conflicts.
    fn overlay(&mut self, other: Self);
}

impl Overlay for serde_json::Value {
    fn overlay(&mut self, other: Self) {
        match (self, other) {
            (Self::Object(base), Self::Object(over)) => {
                for (key, value) in over {
                    match base.get_mut(&key) {
                        Some(existing) => existing.overlay(value),
                        None => {
                            base.insert(key, value);
                        }
                    }
                }
            }
            (slot, value) => *slot = value,
        }
    }
}

impl Overlay for toml::Value {
    fn overlay(&mut self, other: Self) {
        match (self, other) {
            (Self::Table(base), Self::Table(over)) => {
                for (key, value) in over {
                    match base.get_mut(&key) {
                        Some(existing) => existing.overlay(value),
                        None => {
                            base.insert(key, value);
                        }
                    }
                }
            }
            (slot, value) => *slot = value,
        }
    }
}

/// Merges a TOML override over a TOML base and re-encodes the result.
///
/// A blank override leaves the base unchanged.
///
/// # Errors
///
/// Returns [`OverlayError`] when either side fails to parse or the merged
/// table cannot be encoded.
pub fn overlay_toml(base: &str, override_doc: &str) -> Result<String, OverlayError> {
    let mut merged = parse_toml(base).map_err(|message| OverlayError::Base {
        format: "toml",
        message,
    })?;
    if !override_doc.trim().is_empty() {
        let over = parse_toml(override_doc).map_err(|message| OverlayError::Override {
            format: "toml",
            message,
        })?;
        merged.overlay(over);
    }
    toml::to_string_pretty(&merged).map_err(|err| OverlayError::Encode {
        format: "toml",
        message: err.to_string(),
    })
}

/// Merges a JSON override over a JSON value in place.
///
/// # Errors
///
/// Returns [`OverlayError::Override`] when the override is not valid JSON.
pub fn overlay_json(base: &mut serde_json::Value, override_doc: &str) -> Result<(), OverlayError> {
    if override_doc.trim().is_empty() {
        return Ok(());
    }
    let over: serde_json::Value =
        serde_json::from_str(override_doc).map_err(|err| OverlayError::Override {
            format: "json",
            message: err.to_string(),
        })?;
    base.overlay(over);
    Ok(())
}

fn parse_toml(contents: &str) -> Result<toml::Value, String> {
    if contents.trim().is_empty() {
        return Ok(toml::Value::Table(toml::value::Table::new()));
    }
    toml::from_str(contents).map_err(|err| err.to_string())
}
