//! Pool Coordinator
//!
//! Work distribution and share redemption for a two-role proof-of-work mining pool:
//! - A master that follows the chain tip and publishes immutable per-height work
//! - Long-poll HTTP serving of the next height's work and block template
//! - Sharded block handlers that rebuild, validate and submit block shares
//! - A pool client that keeps handlers in sync with the master

pub mod blk_handler;
pub mod client;
pub mod codec;
pub mod config;
pub mod content;
pub mod crypto;
pub mod error;
pub mod longpoll;
pub mod master;
pub mod merkle;
pub mod rpc;
pub mod types;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Application information
pub const APP_NAME: &str = "pool-coordinator";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
