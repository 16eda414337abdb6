/*
    Relay transport - one socket, many topics

    ┌──────────────┐  publish/subscribe   ┌────────────────┐
    │ RelayTransport│ ───────────────────► │ RelayRequester │ ── SocketFrame ──► socket writer
    │  (conn loop)  │                      │  id -> oneshot │ ◄── responses ──── socket reader
    └──────┬───────┘                      └────────────────┘
           │ RelayEvent::Message             ▲          ▲
           ▼                                 │          │
       dispatcher                      Subscriber   Publisher
                                      topic -> id   queued publishes,
                                      (persisted)   redelivered on heartbeat

    The socket itself sits behind the `Connector` trait so tests can run
    against an in-process relay.
*/

mod heartbeat;
pub mod messages;
pub mod metrics;
mod publisher;
mod requester;
pub mod socket;
mod subscriber;
mod transport;

pub use heartbeat::Heartbeat;
pub use messages::RelayMethods;
pub use publisher::PublishOptions;
pub use requester::{ConnectionState, RelayRequester};
pub use socket::{Connector, SocketConnection, SocketEvent, SocketFrame, WsConnector};
pub use subscriber::Subscriber;
pub use transport::{RelayEvent, RelayMessage, RelayTransport};
