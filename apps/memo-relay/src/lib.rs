//! Realtime memo collaboration relay.
//!
//! Authenticated websocket clients join groups and exchange memo mutations.
//! Every mutation is committed through the REST backend before it is fanned
//! out to the other members of the group.

pub mod auth;
pub mod bridge;
pub mod broadcast;
pub mod config;
pub mod handler;
pub mod membership;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod telemetry;
