//! Relay Discord interactions from a public HTTP endpoint to agents
//! subscribed over Redis pub/sub.

pub mod broker;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod discord_api;
pub mod interaction;
pub mod listener;
pub mod logging;
pub mod prereq;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod server;
pub mod signature;
pub mod supervisor;
pub mod tunnel;
