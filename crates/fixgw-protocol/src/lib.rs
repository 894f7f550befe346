//! # fixgw-protocol
//!
//! Netfix protocol frame types and codec.
//!
//! Netfix is a newline-delimited ASCII protocol. A line is either a plain
//! value update (`KEY;VALUE;FLAGS`) or a command (`@<letter><payload>`).
//! This crate turns lines into [`Frame`]s and builds every line the server
//! and client send.

pub mod codec;
pub mod frame;

pub use codec::*;
pub use frame::*;
