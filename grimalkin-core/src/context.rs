//! Per-request context: who is acting, and until when.

use std::time::{Duration, Instant};

use crate::models::ValidationError;

/// Carried into every store operation.
///
/// The acting user is filled in by the authentication layer; the deadline
/// bounds every pool checkout and statement issued on behalf of the request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    acting_user: Option<String>,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context with no authenticated user and no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn for_user(username: impl Into<String>) -> Self {
        Self {
            acting_user: Some(username.into()),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Username of the authenticated caller.
    pub fn acting_user(&self) -> Result<&str, ValidationError> {
        self.acting_user
            .as_deref()
            .ok_or(ValidationError::MissingActingUser)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}
