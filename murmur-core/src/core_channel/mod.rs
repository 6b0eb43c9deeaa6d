/*
    core_channel - Realtime push channel

    Handles:
    - Frame codec for the chat and security endpoints
    - Transport seam (WebSocket in production, mocks in tests)
    - ChannelSession state machine with pluggable reconnect policy
    - Security verification channel (persistent retry)
*/

pub mod frame;
pub mod policy;
pub mod session;
pub mod transport;
pub mod verification;
pub mod ws;

pub use frame::{ChatFrame, InboundFrame, OutboundFrame, ProtocolError};
pub use policy::ReconnectPolicy;
pub use session::{ChannelSession, LinkEvent, SendOutcome, SessionNotice, SessionState};
pub use transport::{ChannelError, ChannelResult, PushLink, PushTransport};
pub use verification::{VerificationChannel, VerificationStatus};
pub use ws::WsTransport;
