//! Flow Coordinator
//!
//! The register / wait / resolve protocol. A registration is one blocked
//! caller; it moves once from `WAITING` to a terminal state and never again.

mod coordinator;
mod registration;

pub use coordinator::{FlowCoordinator, WaitRequest};
pub use registration::{
    CancelReason, DeliveredMessage, Registration, RegistrationStatus, Terminal, Transition,
    WaitOutcome,
};
