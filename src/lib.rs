//! Multi-cluster Proxmox VE API client core.
//!
//! A single, coherent view over one or more Proxmox VE clusters through the
//! PVE REST API, intended for consumption by a terminal UI (out of scope
//! for this crate). See `DESIGN.md` for the grounding ledger behind each
//! module's implementation choices.
//!
//! Dependency order (leaves first): [`cache`]/[`logger`]/[`config`] are the
//! pluggable interfaces the rest of the crate is built against; [`auth`]
//! and [`transport`] form the authenticated HTTP layer; [`client`] is a
//! single cluster connection with the high-level endpoints and VM
//! enrichment pipeline; [`group`] and [`failover`] are the two
//! multi-cluster managers built on top of it; [`poller`] watches
//! asynchronous task UPIDs independent of which manager submitted them.

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod failover;
pub mod group;
pub mod logger;
pub mod model;
pub mod parsers;
pub mod poller;
pub mod transport;

pub use cache::{Cache, NoOpCache};
pub use client::Client;
pub use config::{Config, StaticConfig};
pub use error::{Error, Result};
pub use failover::FailoverManager;
pub use group::{GroupManager, ProfileClient, ProfileResult, ProfileStatus};
pub use logger::{Logger, NoOpLogger};
pub use poller::TaskPoller;
