//! Fleet runtime for simulated solar-panel cleaning robots
//!
//! Owns the broker connection, the configuration store, and the set of
//! live simulated robots. Each robot keeps its own telemetry state and a
//! periodic reporter; the fleet manager routes downlink frames to the
//! right robot and serializes all uplink traffic through one sender.

pub mod fleet;
pub mod robot;
pub mod state;
pub mod store;

pub use fleet::{FleetError, FleetManager, OutboundMessage};
pub use robot::{Robot, RobotConfig, RobotSnapshot};
pub use state::RobotState;
pub use store::{BrokerSettings, ConfigStore, RosterEntry, RosterPage, StoreError};
