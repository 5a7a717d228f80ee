//! g2a gateway storage engine: persistence for the configuration document
//! and the credential-token pools behind one backend contract.
//!
//! Library crate shared by the `g2a` binary and the integration tests in
//! `tests/`.

pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod errors;
pub mod models;
pub mod store;
