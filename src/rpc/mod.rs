//! Wire-level protocol for the call multiplexer
//!
//! Defines the request/response envelopes exchanged over a connection and the
//! newline-delimited JSON codec that frames them.

pub mod codec;
pub mod envelope;
