//! # courier-core
//!
//! Shared types for the courier messaging transport.
//!
//! - [`MessageEnvelope`]: the chat payload exchanged over the wire
//! - [`Topic`]: per-recipient subscription key (`messages/{recipientId}`)
//! - Branded ids for consumers and subscriptions
//! - [`CourierError`]: the error taxonomy shared by every layer
//! - [`CredentialSource`]: where the bearer token comes from

#![deny(unsafe_code)]

pub mod credentials;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod topic;

pub use credentials::{CredentialSource, CredentialStore, EnvToken, StaticToken};
pub use envelope::{MessageEnvelope, DEFAULT_MESSAGE_KIND};
pub use errors::{CourierError, Result};
pub use ids::{ConsumerId, SubscriptionId};
pub use topic::Topic;
