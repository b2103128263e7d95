//! Hostgate - an edge gateway for a containerized application platform
//!
//! This library provides a virtual-host gateway that:
//! - Terminates inbound HTTP/HTTPS/WebSocket traffic and forwards it to the
//!   right backend container by Host
//! - Keeps the host-to-backend routing table synchronized with the platform's
//!   dynamic network topology, rebuilding and swapping it atomically
//! - Watches each application's external IP and reloads routes on change
//! - Provisions per-application macvlan interfaces with stable, persisted
//!   MAC addresses
//! - Tunnels CONNECT requests to the local SSH endpoint
//! - Exposes a loopback control API for reloads and interface management

pub mod config;
pub mod control;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod inventory;
pub mod netif;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod settings;
