//! # coap-gateway
//!
//! A bidirectional gateway that carries the Matrix client-server API over
//! CoAP, shrinking bytes-on-wire for constrained links:
//!
//! - **[`codec`]** — JSON bodies are re-encoded as CBOR, with well-known
//!   object keys replaced by small integers from a fixed dictionary.
//! - **[`paths`]** — long static URL prefixes collapse into single-character
//!   enum codes while dynamic path parameters survive.
//! - **[`observe`]** — the `/sync` long-poll is mapped onto CoAP OBSERVE:
//!   the gateway polls the homeserver on the client's behalf and pushes only
//!   meaningful changes as confirmable notifications.
//!
//! The server side ([`gateway`] + [`server`]) accepts CoAP from constrained
//! clients and speaks HTTP to the homeserver. The client side ([`client`] +
//! [`session`]) does the reverse for a local Matrix client.
//!
//! ```text
//! CoAP/UDP in -> mapper -> HTTP request -> homeserver
//!                                   |
//! CoAP out <- codec (JSON->CBOR) <--+ HTTP response
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

pub mod client;
pub mod codec;
pub mod config;
pub mod dict;
pub mod gateway;
pub mod mapper;
pub mod observe;
pub mod paths;
pub mod server;
pub mod session;

use coap_lite::Packet;

use crate::mapper::{HttpRequest, HttpResponse};

/// Error type for all gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed JSON or CBOR, or an unrepresentable value during transcoding.
    #[error("transcoding error: {0}")]
    Transcode(String),

    /// Unknown method, status code or CoAP code during message mapping.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Transport-level failure (send failed, malformed datagram, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The CoAP session backing this exchange is gone.
    #[error("session closed")]
    SessionClosed,

    /// The peer answered a confirmable message with a Reset.
    #[error("peer reset")]
    Reset,

    /// No acknowledgement arrived within the retransmission budget.
    #[error("acknowledgement timeout")]
    AckTimeout,

    /// The upstream origin could not be reached or misbehaved.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// OBSERVE registration bookkeeping failure.
    #[error("observe error: {0}")]
    Observe(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error from the socket layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Counters for conditions we tolerate on the wire but want visibility on.
#[derive(Debug, Default)]
pub struct Metrics {
    /// CBOR map keys that were neither integers nor stringifiable and were
    /// discarded during CBOR->JSON conversion.
    pub dropped_keys: AtomicU64,
    /// HTTP statuses with no CoAP equivalent, sent as Empty.
    pub unknown_status: AtomicU64,
    /// Uri-Query options that were not `k=v` shaped and were skipped.
    pub skipped_query_items: AtomicU64,
}

impl Metrics {
    pub fn dropped_keys(&self) -> u64 {
        self.dropped_keys.load(Ordering::Relaxed)
    }

    pub fn unknown_status(&self) -> u64 {
        self.unknown_status.load(Ordering::Relaxed)
    }

    pub fn skipped_query_items(&self) -> u64 {
        self.skipped_query_items.load(Ordering::Relaxed)
    }
}

/// The upstream HTTP origin, usually a Matrix homeserver.
///
/// The OBSERVE engine and the server-side dispatcher both call into this;
/// tests substitute an in-memory implementation.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn handle(&self, req: &HttpRequest) -> Result<HttpResponse>;
}

/// Outbound packet sink for one client endpoint.
///
/// Implementations deliver the packet to the peer. For confirmable packets
/// the call resolves once the peer acknowledges and fails on Reset or on an
/// exhausted retransmission budget; everything else resolves after the
/// datagram is handed to the transport. A zero `message_id` is assigned by
/// the sink.
#[async_trait::async_trait]
pub trait NotifySink: Send + Sync + 'static {
    async fn send(&self, packet: Packet) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::Transcode("bad cbor".to_string());
        assert_eq!(err.to_string(), "transcoding error: bad cbor");
        assert_eq!(GatewayError::SessionClosed.to_string(), "session closed");
    }

    #[test]
    fn test_metrics_start_at_zero() {
        let metrics = Metrics::default();
        assert_eq!(metrics.dropped_keys(), 0);
        assert_eq!(metrics.unknown_status(), 0);
        assert_eq!(metrics.skipped_query_items(), 0);
    }
}
