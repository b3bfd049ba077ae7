//! Game coordination: wire protocol, connections, the per-session state machine,
//! scoring, the session registry and session creation.

pub mod connection;
pub mod create;
pub mod protocol;
pub mod registry;
pub mod scoring;
pub mod session;

pub use connection::{serve, Connection, ConnectionId, DeliveryError, Outbound, Role, TransportError};
pub use create::{create_session, CreateSessionError, CreatedSession};
pub use protocol::{ClientMessage, Envelope, Frame, HostCommand, ProtocolError, ServerMessage, SessionStatus};
pub use registry::{RegistryError, SessionRegistry};
pub use scoring::ScoringPolicy;
pub use session::{GameSession, SessionError, SessionHandle, SessionInfo, SessionSettings, SessionSnapshot};
