//! Row validation
//!
//! Turns the trimmed fields of one CSV line into a [`UserRecord`]. Checks run
//! in column order and stop at the first problem:
//!
//! 1. at least four fields are present
//! 2. `id`, `firstName` and `lastName` are non-blank
//! 3. `email` matches [`EMAIL_PATTERN`]
//!
//! Columns past the fourth are ignored.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::UserRecord;

/// Minimum number of columns in a data row
pub const REQUIRED_COLUMNS: usize = 4;

/// ASCII word characters, hyphens and dots; then `@`; one or more labels; a
/// 2-4 character top-level label
pub const EMAIL_PATTERN: &str =
    r"^[A-Za-z0-9_.\-]+@([A-Za-z0-9_\-]+\.)+[A-Za-z0-9_\-]{2,4}$";

#[allow(clippy::expect_used)]
static EMAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(EMAIL_PATTERN).expect("EMAIL_PATTERN is a valid regex"));

/// A required column of the user CSV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UserField {
    Id,
    FirstName,
    LastName,
    Email,
}

impl UserField {
    /// Column name as it appears in the CSV header
    pub fn column(self) -> &'static str {
        match self {
            UserField::Id => "id",
            UserField::FirstName => "firstName",
            UserField::LastName => "lastName",
            UserField::Email => "email",
        }
    }
}

impl std::fmt::Display for UserField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.column())
    }
}

/// Why a row was rejected
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum ValidationError {
    #[error("Line has insufficient columns: expected {REQUIRED_COLUMNS}, got {0}")]
    InsufficientColumns(usize),

    #[error("{0} is required")]
    MissingField(UserField),

    #[error("Invalid email: {0}")]
    InvalidEmail(String),

    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),
}

/// Validate the fields of one row
///
/// Fields are expected to be trimmed already; blank checks trim again so
/// callers passing raw fields get the same answer.
pub fn validate<S: AsRef<str>>(fields: &[S]) -> Result<UserRecord, ValidationError> {
    let [id, first_name, last_name, email, ..] = fields else {
        return Err(ValidationError::InsufficientColumns(fields.len()));
    };

    let id = required(id.as_ref(), UserField::Id)?;
    let first_name = required(first_name.as_ref(), UserField::FirstName)?;
    let last_name = required(last_name.as_ref(), UserField::LastName)?;

    let email = email.as_ref().trim();
    if !is_valid_email(email) {
        return Err(ValidationError::InvalidEmail(email.to_string()));
    }

    Ok(UserRecord {
        id,
        first_name,
        last_name,
        email: email.to_string(),
    })
}

/// Check an address against [`EMAIL_PATTERN`]
#[inline]
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email)
}

fn required(value: &str, field: UserField) -> Result<String, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(value.to_string())
}
