//! Resource name validation.
//!
//! Namespaces and resource names follow the DNS-1123 label rules: lowercase
//! alphanumerics and `-`, starting and ending with an alphanumeric, at most
//! 63 characters.

use regex_lite::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Maximum length of a DNS-1123 label.
pub const MAX_NAME_LEN: usize = 63;

/// Name validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} '{value}' exceeds {MAX_NAME_LEN} characters")]
    TooLong { field: &'static str, value: String },

    #[error("{field} '{value}' is not a valid DNS-1123 label")]
    Invalid { field: &'static str, value: String },
}

fn label_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").ok())
        .as_ref()
}

/// Validate a namespace or resource name.
pub fn validate_name(field: &'static str, value: &str) -> Result<(), NameError> {
    if value.is_empty() {
        return Err(NameError::Empty { field });
    }
    if value.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong {
            field,
            value: value.to_string(),
        });
    }
    if !label_regex().is_some_and(|re| re.is_match(value)) {
        return Err(NameError::Invalid {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
