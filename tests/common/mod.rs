//! Integration test common infrastructure.
//!
//! Provides utilities for spawning roomserverd instances over a spool
//! directory and querying them over HTTP.

pub mod client;
pub mod server;

#[allow(unused_imports)]
pub use client::post_json;
#[allow(unused_imports)]
pub use server::TestServer;
