//! Room-based signaling for one-to-one WebRTC calls.
//!
//! The relay ([`room`]) pairs connections by room identifier and forwards
//! negotiation messages between them without reading their payload. Each
//! peer runs a [`controller::SessionController`] that drives a
//! [`negotiation::NegotiationSession`] over some [`engine::MediaEngine`].

pub mod config;
pub mod connection;
pub mod controller;
pub mod engine;
pub mod error;
pub mod negotiation;
pub mod peer_connection;
pub mod room;
pub mod signaling;

// In-memory engine and backend for driving peers without a network stack
pub mod testing;

pub use error::{Error, Result};
