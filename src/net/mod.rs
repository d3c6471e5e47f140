//! Server connectivity: the duplex session and the REST client.

pub mod api;
pub mod session;

pub use api::ApiClient;
pub use session::{
    ConnectionSession, ConnectionState, OutboundSender, SessionEvent, KEEPALIVE_INTERVAL,
    RECONNECT_DELAY, SEND_RETRY_DELAY,
};
