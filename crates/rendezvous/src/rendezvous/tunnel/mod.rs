//! Rendezvous relay: servers register under a uuid, clients register against
//! that uuid, and the relay joins them. Server connections carry SLIP frames
//! addressed per client; client connections stay raw.

pub mod api;
pub mod auth;
pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod handle;
pub mod keepalive;
pub mod manager;
pub mod peer;
pub mod registry;
pub mod relay;
pub mod rpc;
pub mod server;
pub mod session;
pub mod slip;
pub mod transport;
