pub mod config;
pub mod diff;
pub mod fingerprint;
pub mod gw2api;
mod http;
pub mod mapping;
pub mod monitor;
pub mod policy;
pub mod publish;
pub mod report;
pub mod roster;
pub mod runtime;
pub mod store;
pub mod webhook;
pub mod worlds;
