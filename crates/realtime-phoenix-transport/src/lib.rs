//! Supabase Realtime transport for the NGOBRAS sync core.
//!
//! This crate provides:
//! - A Phoenix-channels WebSocket client (JSON serializer, vsn 1.0.0)
//! - `postgres_changes` INSERT subscriptions, one topic per logical channel
//! - Heartbeats and join timeouts
//! - A `TransportConnector` implementation for `SubscriptionManager`

mod client;
mod error;
mod messages;

pub use client::{PhoenixClient, PhoenixConfig, PhoenixConnector};
pub use error::{PhoenixError, PhoenixResult};
pub use messages::{topic_for, PhoenixMessage};
