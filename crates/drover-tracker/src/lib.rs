//! Typed client for the project tracker's HTTP API.
//!
//! The orchestrator core talks to the tracker exclusively through the
//! [`TrackerApi`] trait so tests can substitute an in-memory fake. The
//! production implementation is [`PlaneClient`], a thin `reqwest` wrapper
//! that validates every response at the boundary.

mod api;
mod client;
pub mod models;

pub use api::TrackerApi;
pub use client::PlaneClient;

use thiserror::Error;

/// Errors that can occur talking to the tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The HTTP request itself failed (connection, TLS, timeout).
    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The tracker returned a non-success status code.
    #[error("tracker returned {status} for {url}: {body}")]
    Api {
        status: u16,
        url: String,
        body: String,
    },

    /// The response body did not match the expected shape.
    #[error("failed to decode tracker response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}
