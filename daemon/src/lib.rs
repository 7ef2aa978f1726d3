//! minerguard: keeps a local cgminer-compatible miner in the state the operator
//! asked for, polls its API, and keeps a week of hash-rate history.

pub mod collector;
pub mod config;
pub mod db;
pub mod events;
pub mod executor;
pub mod gate;
pub mod link;
pub mod protocol;
pub mod socket;
pub mod supervisor;
pub mod telemetry;
pub mod wire;
