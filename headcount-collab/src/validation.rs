use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    static ref PASSCODE_REGEX: Regex = Regex::new(r"^[0-9]{6}$").expect("regex is valid");
    static ref EMAIL_REGEX: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("regex is valid");
    static ref IDENTIFIER_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").expect("regex is valid");
}

const MAX_NAME_LENGTH: usize = 120;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Required { field: &'static str },
    #[error("{field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("A passcode is exactly 6 digits")]
    MalformedPasscode,
    #[error("The email address is malformed")]
    MalformedEmail,
    #[error("{field} is not a valid identifier")]
    MalformedIdentifier { field: &'static str },
}

/// Checks that a human-entered name is present and reasonably sized.
pub fn name(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let trimmed = value.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::Required { field });
    }

    if trimmed.len() > MAX_NAME_LENGTH {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_NAME_LENGTH,
        });
    }

    Ok(())
}

pub fn required(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required { field });
    }

    Ok(())
}

pub fn passcode(value: &str) -> Result<(), ValidationError> {
    if !PASSCODE_REGEX.is_match(value) {
        return Err(ValidationError::MalformedPasscode);
    }

    Ok(())
}

pub fn email(value: &str) -> Result<(), ValidationError> {
    if !EMAIL_REGEX.is_match(value.trim()) {
        return Err(ValidationError::MalformedEmail);
    }

    Ok(())
}

/// Checks an id that is about to be interpolated into a document path.
pub fn identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if !IDENTIFIER_REGEX.is_match(value) {
        return Err(ValidationError::MalformedIdentifier { field });
    }

    Ok(())
}
