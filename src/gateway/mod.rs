//! Real-time gateway core: connection registry, heartbeat policing, presence
//! tracking, typing indicators, the pub/sub bridge, and the frame router.

pub mod bridge;
pub mod frames;
pub mod heartbeat;
pub mod presence;
pub mod registry;
pub mod router;
pub mod typing;

pub use bridge::{BridgeBackend, EventPublisher, PubSubBridge};
pub use frames::{ClientFrame, ServerFrame};
pub use heartbeat::HeartbeatMonitor;
pub use presence::PresenceTracker;
pub use registry::{ConnectionHandle, ConnectionRegistry, DisconnectCause};
pub use router::MessageRouter;
pub use typing::TypingCoordinator;
