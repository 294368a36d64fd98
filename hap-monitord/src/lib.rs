//! LAN client for HomeKit Accessory Protocol bridges.
//!
//! Discovers accessory servers over mDNS, polls them into a normalized
//! service graph and keeps that graph live through evented connections.

pub mod api;
pub mod catalog;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod handle;
pub mod mdns;
pub mod model;
pub mod monitor;
pub mod poller;
pub mod protocol;
pub mod registry;
