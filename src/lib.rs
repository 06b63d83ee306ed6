//! Unit-level traceability for serialized product codes: the identity model,
//! the code status machine, reverse (replacement) batch jobs and shipment
//! reconciliation sessions.

pub mod api;
pub mod code_format;
pub mod compensation;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod model;
pub mod movement;
pub mod reconciliation;
pub mod reverse;
pub mod state_machine;
