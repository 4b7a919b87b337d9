//! grimalkin-core: the leaf layer of the Q&A data-access core.
//!
//! Holds everything the stores need that does not touch the network:
//! domain models, the UUID codec, validation collaborators, the request
//! context and the injected configuration.

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod models;

pub use codec::{decode, encode, new_time_uuid, StorageUuid};
pub use config::{FanoutRepair, StoreConfig};
pub use context::RequestContext;
pub use error::{ConfigError, MalformedUuid};
pub use models::{
    Answer, NewQuestion, NewUser, QAndA, Question, RuleValidator, User, ValidationError,
    Validator,
};
