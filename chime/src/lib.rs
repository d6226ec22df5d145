//! `Chime` client core: object sync, push routing, and chat sessions for
//! the Chime chat service.

pub mod cache;
pub mod client;
pub mod config;
pub mod jugg;
pub mod messages;
pub mod session;
pub mod sync;
pub mod transport;
