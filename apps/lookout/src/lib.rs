pub mod config;
pub mod negotiation;
pub mod peer;
pub mod router;
pub mod session;
pub mod telemetry;
pub mod transfer;
pub mod transport;
