//! Delivery core of the murmur end-to-end encrypted chat client
//!
//! Keeps the message log of the active one-to-one conversation consistent
//! while messages arrive over a push channel, a polling fallback and the
//! user's own sends, and runs encrypted content through an external
//! decryption capability with a locally held private key.

pub mod config;
pub mod core_api;
pub mod core_channel;
pub mod core_crypto;
pub mod core_delivery;
pub mod core_keys;
pub mod core_model;
pub mod core_store;
pub mod logging;
pub mod metrics;
#[doc(hidden)]
pub mod test_utils;

pub use config::Config;
pub use core_delivery::{CoordinatorDeps, CoordinatorHandle, CoordinatorSettings, DeliveryCoordinator};
pub use logging::{init_logging, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Ensure the main exports are accessible
        let _ = LogLevel::Info;
        let _ = CoordinatorSettings::default();
    }
}
