//! Domain models
//!
//! Plain data carried between the request-handling layer and the stores.
//! Input types (`New*`, [`Answer`]) are checked by a [`Validator`] before
//! any storage I/O happens.

pub mod question;
pub mod user;
pub mod validation;

pub use question::{Answer, NewQuestion, QAndA, Question};
pub use user::{NewUser, User};
pub use validation::{RuleValidator, ValidationError, Validator};
