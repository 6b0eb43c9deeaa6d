//! Test utilities and helpers for murmur
//!
//! In-process stand-ins for the push transport, the message API and the
//! decryption capability, plus fixtures and async helpers shared by unit and
//! integration tests.

pub mod async_helpers;
pub mod fixtures;
pub mod mock_api;
pub mod mock_crypto;
pub mod mock_transport;

pub use async_helpers::*;
pub use fixtures::*;
pub use mock_api::MockMessageApi;
pub use mock_crypto::MockDecryptionCapability;
pub use mock_transport::{MockRemote, MockTransport};
