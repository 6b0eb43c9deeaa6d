//! Delivery coordination for the active conversation
//!
//! Ties the message log, the push channel, the fallback poller and the
//! decryption gateway together behind a single actor task.

pub mod coordinator;
pub mod errors;
pub mod events;
pub mod handle;
pub mod pipeline;
pub mod poller;
pub mod view;

pub use coordinator::{CoordinatorDeps, CoordinatorSettings, DeliveryCoordinator};
pub use errors::{DeliveryError, DeliveryResult};
pub use events::ConversationEpoch;
pub use handle::CoordinatorHandle;
pub use pipeline::FetchPipeline;
pub use poller::FallbackPoller;
pub use view::{ConversationView, ViewState};
