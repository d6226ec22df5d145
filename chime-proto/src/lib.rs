//! Wire record layer for the Chime client.
//!
//! Parses the JSON records the service emits over its REST endpoints and the
//! juggernaut push feed into strongly-typed structs, and implements the
//! mention token codec. No I/O happens here.

pub mod event;
pub mod mention;
pub mod record;
