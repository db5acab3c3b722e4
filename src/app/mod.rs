//! Application layer: the port traits the agents are written against, and
//! the connection task that keeps them supplied with a live session.

pub mod ports;
pub mod supervisor;
