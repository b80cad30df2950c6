//! Auth Gateway: the contract with the remote identity service.
//!
//! This module provides the `AuthGateway` trait consumed by the session
//! controller and profile cache, and `HttpAuthGateway`, a REST
//! implementation that authenticates with bearer tokens read from the
//! credential store.

pub mod client;
pub mod error;
pub mod gateway;

pub use client::HttpAuthGateway;
pub use error::AuthError;
pub use gateway::AuthGateway;

#[cfg(test)]
pub(crate) mod mock;
