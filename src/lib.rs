//! xbus - bidirectional RPC over message-passing transports.
//!
//! Two isolated execution contexts, each exposing named interfaces the
//! other can call like local async functions, connected by nothing more
//! than an unordered-safe message channel. Establishment runs in two
//! stages: a hello handshake confirms both sides are listening, then the
//! declared protocol sets are compared for exact agreement before any
//! user traffic flows. After that, calls multiplex freely in both
//! directions over one endpoint, correlated by message id.
//!
//! Every call resolves to a typed result, never a panic or a hung future:
//! timeouts, peer disappearance and handler failures all surface as
//! [`BusError`] values.

pub mod bus;
pub mod close;
pub mod connect;
pub mod end;
pub mod error;
pub mod handshake;
pub mod message;
pub mod once;
pub mod port;
pub mod sender;

pub use bus::{BusConfig, BusConnection, ProtocolBinding, ProtocolHandler, StubHandler};
pub use close::{CloseController, CloseSubscription};
pub use connect::{connect, connect_pair, ConnectOptions};
pub use end::{establish, linked_pair, ClosePolicy, End, EndOptions, Established};
pub use error::{BusError, BusResult, ErrorCode};
pub use handshake::{Role, DEFAULT_TIMEOUT};
pub use message::{FunctionId, MessageId, Payload, FIRST_USER_FUNCTION_ID, INTERNAL_PROTOCOL};
pub use once::ConnectOnce;
pub use port::{channel_port_pair, ChannelPort, FrameTransport, FramedPort, Port, PortError};
pub use sender::ProtocolSender;
