//! Domain layer - Core types and port definitions
//!
//! This module defines identities, name references and the gateway port that
//! transport adapters implement, following hexagonal architecture principles.

pub mod ports;

pub use ports::*;
