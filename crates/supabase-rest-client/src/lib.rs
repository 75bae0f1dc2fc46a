//! PostgREST client for the NGOBRAS `messages` table.
//!
//! Implements the pull-side collaborators of the sync core:
//!
//! ```text
//! SubscriptionManager ── MessageFetcher ──────▶ GET   /rest/v1/messages?or=(...)
//!                     ── ReadReceiptSink ─────▶ PATCH /rest/v1/messages?is_read=eq.false
//!                     ── OutboundMessageStore ▶ POST  /rest/v1/messages (return=representation)
//! ```
//!
//! Failures are returned to the manager as `SyncError`, which logs them and
//! keeps polling with backoff.

mod client;
mod error;

pub use client::SupabaseClient;
pub use error::{RestClientError, RestClientResult};
