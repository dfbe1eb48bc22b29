#![deny(unsafe_code)]

pub mod hash;
pub mod account;
pub mod threshold;
pub mod group;
pub mod state;
pub mod block;
pub mod fault;
pub mod config;
pub mod beacon;
pub mod notary;
pub mod chain;

#[cfg(test)]
pub mod testing;

pub use beacon::RandomBeacon;
pub use chain::{Chain, Event};
pub use config::Config;
pub use fault::Fault;
pub use notary::Notary;
