//! Domain model module declarations.

pub mod agent;
pub mod lease;
pub mod session;
