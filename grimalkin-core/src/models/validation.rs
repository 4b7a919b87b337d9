//! Validation errors and the validator collaborator
//!
//! Input rules live behind [`Validator`] so the request-handling layer can
//! swap them; [`RuleValidator`] carries the default rules.

use std::fmt;

use super::{Answer, NewQuestion, NewUser};

/// Longest accepted username
pub const MAX_USERNAME_LEN: usize = 12;

/// Longest accepted password
pub const MAX_PASSWORD_LEN: usize = 36;

/// Validation error for domain models
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Field is empty when it shouldn't be
    Empty { field: &'static str },

    /// Field exceeds maximum length
    TooLong { field: &'static str, max: usize },

    /// String doesn't match required format
    InvalidFormat { field: &'static str, reason: &'static str },

    /// No authenticated user on the request
    MissingActingUser,

    /// Acting user may not perform this operation
    NotPermitted { user: String, reason: &'static str },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty { field } => write!(f, "{} cannot be empty", field),
            Self::TooLong { field, max } => {
                write!(f, "{} cannot be longer than {} characters", field, max)
            }
            Self::InvalidFormat { field, reason } => write!(f, "{}: {}", field, reason),
            Self::MissingActingUser => write!(f, "no authenticated user on request"),
            Self::NotPermitted { user, reason } => write!(f, "{} {}", user, reason),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Predicate collaborator consulted before any I/O.
pub trait Validator: Send + Sync {
    fn validate_question(&self, question: &NewQuestion) -> Result<(), ValidationError>;

    fn validate_registration(&self, user: &NewUser) -> Result<(), ValidationError>;

    fn validate_answer(&self, answer: &Answer) -> Result<(), ValidationError> {
        require_username("asked", &answer.asked)?;
        require("answer", &answer.answer)
    }
}

/// Default rule set.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleValidator;

impl Validator for RuleValidator {
    fn validate_question(&self, question: &NewQuestion) -> Result<(), ValidationError> {
        require_username("asked", &question.asked)?;
        require_username("asker", &question.asker)?;
        require("question", &question.question)
    }

    fn validate_registration(&self, user: &NewUser) -> Result<(), ValidationError> {
        require("username", &user.username)?;
        require("password", &user.password)?;
        require("email", &user.email)?;
        require("first name", &user.first_name)?;
        require("last name", &user.last_name)?;
        max_len("username", &user.username, MAX_USERNAME_LEN)?;
        max_len("password", &user.password, MAX_PASSWORD_LEN)?;
        if !user.email.contains('@') {
            return Err(ValidationError::InvalidFormat {
                field: "email",
                reason: "must contain '@'",
            });
        }
        Ok(())
    }
}

/// Reject empty or whitespace-only text.
pub fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    Ok(())
}

/// Non-empty and within the username length limit.
pub fn require_username(field: &'static str, value: &str) -> Result<(), ValidationError> {
    require(field, value)?;
    max_len(field, value, MAX_USERNAME_LEN)
}

fn max_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}
