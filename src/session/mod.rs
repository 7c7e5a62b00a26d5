//! Device sessions
//!
//! # Submodules
//!
//! - `state` - Session state machine, transition log and retry policy
//! - `gate` - Exclusive, priority-aware access to the transport channel
//! - `handle` - The `Session` handle given to extractors
//! - `registry` - Caller-owned serial -> session map
//! - `manager` - Discovery, transport selection and connection lifecycle
//! - `monitor` - Background heartbeat thread

pub mod gate;
pub mod handle;
pub mod manager;
pub mod monitor;
pub mod registry;
pub mod state;

pub use gate::{GatePermit, TransportGate};
pub use handle::Session;
pub use manager::{Connection, DeviceSessionManager, TransportSubstitution};
pub use monitor::HeartbeatMonitor;
pub use registry::{RegisteredSession, SessionRegistry};
pub use state::{RetryPolicy, SessionState, StateMachine, StateTransition};
