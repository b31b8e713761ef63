//! Rendezvous relay and tunnel client library.

pub mod rendezvous;

pub use rendezvous::{run, tunnel};
