/// WebSocket real-time notification system
///
/// Architecture:
/// 1. ConnectionRegistry: admitted sockets plus the per-user index, one lock
/// 2. ConnectionManager: routes events to connections, users, roles and channels
/// 3. Delivery tracking: bounded resends until the client acks
/// 4. Heartbeat: protocol ping each cycle, dead sockets terminated
/// 5. RealtimeService: lifecycle owner injected into handlers
pub mod connection;
pub mod delivery;
pub mod heartbeat;
pub mod manager;
pub mod messages;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod session;

pub use connection::{transport, ConnectionId, Frame, FrameReceiver, FrameSender};
pub use delivery::{DeliveryPolicy, PendingAck, RetryOutcome, RetryPolicy};
pub use heartbeat::{sweep, HeartbeatReport};
pub use manager::ConnectionManager;
pub use messages::{channels, events, ClientFrame, ServerEnvelope};
pub use registry::{ConnectionRegistry, RegistryStats};
pub use service::RealtimeService;
pub use session::{RejectedSession, WsSession};
