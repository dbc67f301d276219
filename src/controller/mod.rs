//! Controller module for pg-ha-supervisor.
//!
//! Contains the failover control loop, the role state machine, fencing,
//! error handling and status reporting.

pub mod context;
pub mod error;
pub mod failover;
pub mod fencing;
pub mod state_machine;
pub mod status;

pub use context::Context;
pub use error::{Error, Result};
pub use failover::{Collaborators, FailoverController};
pub use fencing::WriteGate;
pub use state_machine::{MemberEvent, MemberState};
pub use status::{ClusterStatus, MemberStatus};
