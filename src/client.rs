//! Client-side proxy: HTTP in, CoAP out.
//!
//! Runs next to a Matrix client on the mobile side of the link. Incoming
//! HTTP requests are compressed (path enum, CBOR body, option 256 for the
//! bearer token) and sent over a cached CoAP session to the remote gateway;
//! responses come back decoded to JSON.
//!
//! With OBSERVE enabled, sync long-polls do not cross the radio at all
//! after the first registration: the proxy drains the notification queue
//! and, when the stream is idle past the configured window, synthesizes an
//! empty sync response echoing the caller's `since` so the local client
//! keeps believing its long-poll is healthy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use coap_lite::Packet;
use http::StatusCode;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::config::{GatewayConfig, TransportConfig};
use crate::gateway::proxy_failure_response;
use crate::mapper::{HttpRequest, HttpResponse, Mapper, ACCESS_TOKEN_OPTION};
use crate::observe::SYNC_PATH;
use crate::session::{CoapSession, SessionFactory};
use crate::{GatewayError, Result};

struct CacheEntry {
    session: Arc<CoapSession>,
    /// Last bearer token transmitted on this session.
    last_token: Arc<Mutex<Option<String>>>,
    /// Transport parameters the session was built with; a change forces a
    /// reconnect.
    config: TransportConfig,
}

type SessionMap = Arc<Mutex<HashMap<String, CacheEntry>>>;

/// Cache of live outbound sessions keyed by authority.
pub struct OutboundConnCache<F> {
    factory: F,
    config: Mutex<TransportConfig>,
    sessions: SessionMap,
}

impl<F: SessionFactory> OutboundConnCache<F> {
    pub fn new(factory: F, config: TransportConfig) -> Self {
        Self {
            factory,
            config: Mutex::new(config),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Change the transport parameters; existing sessions are rebuilt on
    /// their next use.
    pub async fn set_transport_config(&self, config: TransportConfig) {
        *self.config.lock().await = config;
    }

    /// Session for `authority`, connecting if there is none alive.
    pub async fn get(&self, authority: &str) -> Result<(Arc<CoapSession>, Arc<Mutex<Option<String>>>)> {
        let config = self.config.lock().await.clone();
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(authority) {
            if !entry.session.is_closed() && entry.config == config {
                return Ok((entry.session.clone(), entry.last_token.clone()));
            }
        }

        debug!(authority, "connecting outbound session");
        let session = self.factory.connect(authority, &config).await?;
        let last_token = Arc::new(Mutex::new(None));
        sessions.insert(
            authority.to_string(),
            CacheEntry {
                session: session.clone(),
                last_token: last_token.clone(),
                config,
            },
        );
        spawn_eviction(self.sessions.clone(), authority.to_string(), session.clone());
        Ok((session, last_token))
    }

    /// Drop any cached session for `authority` and connect a fresh one.
    pub async fn rebuild(
        &self,
        authority: &str,
    ) -> Result<(Arc<CoapSession>, Arc<Mutex<Option<String>>>)> {
        if let Some(entry) = self.sessions.lock().await.remove(authority) {
            entry.session.close();
        }
        self.get(authority).await
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Remove the cache entry once its session closes.
fn spawn_eviction(sessions: SessionMap, authority: String, session: Arc<CoapSession>) {
    tokio::spawn(async move {
        session.closed().await;
        let mut sessions = sessions.lock().await;
        let stale = sessions
            .get(&authority)
            .map(|entry| Arc::ptr_eq(&entry.session, &session))
            .unwrap_or(false);
        if stale {
            debug!(%authority, "evicting closed session");
            sessions.remove(&authority);
        }
    });
}

struct SyncStream {
    session: Arc<CoapSession>,
    queue: Arc<Mutex<mpsc::Receiver<Packet>>>,
}

/// The HTTP-facing proxy.
pub struct ClientProxy<F> {
    mapper: Mapper,
    cache: OutboundConnCache<F>,
    config: GatewayConfig,
    streams: Mutex<HashMap<String, SyncStream>>,
}

impl<F: SessionFactory> ClientProxy<F> {
    pub fn new(mapper: Mapper, factory: F, config: GatewayConfig) -> Self {
        Self {
            mapper,
            cache: OutboundConnCache::new(factory, config.transport.clone()),
            config,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &OutboundConnCache<F> {
        &self.cache
    }

    /// Forward one HTTP request to the remote gateway at `authority`.
    ///
    /// Never fails: gateway-level errors surface as a 502 with a
    /// `{"errcode":"PROXY"}` body.
    #[instrument(skip_all, fields(http_method = %request.method, http_path = %request.path))]
    pub async fn forward(&self, request: HttpRequest, authority: &str) -> HttpResponse {
        match self.try_forward(request, authority).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "forwarding failed");
                proxy_failure_response(&e)
            }
        }
    }

    async fn try_forward(&self, request: HttpRequest, authority: &str) -> Result<HttpResponse> {
        let packet = self.mapper.http_to_coap_request(&request)?;
        if self.config.observe_enabled && is_sync_path(&request.path) {
            return self.forward_sync(&request, authority, packet).await;
        }
        let response = self.exchange(authority, packet).await?;
        self.mapper.coap_to_http_response(&response)
    }

    /// One request/response round-trip with per-session token dedup and a
    /// single rebuild-and-retry on a dead session.
    async fn exchange(&self, authority: &str, packet: Packet) -> Result<Packet> {
        let (session, last_token) = self.cache.get(authority).await?;
        let deduplicated = strip_repeated_token(&packet, &*last_token.lock().await);
        match session.request(deduplicated).await {
            Ok(response) => {
                remember_token(&packet, &last_token).await;
                Ok(response)
            }
            Err(
                GatewayError::SessionClosed | GatewayError::AckTimeout | GatewayError::Transport(_),
            ) => {
                debug!(authority, "session gone, rebuilding and retrying once");
                let (session, last_token) = self.cache.rebuild(authority).await?;
                // Fresh session: the token cache is empty, send in full.
                let response = session.request(packet.clone()).await?;
                remember_token(&packet, &last_token).await;
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }

    /// Serve a sync long-poll from the OBSERVE notification stream.
    async fn forward_sync(
        &self,
        request: &HttpRequest,
        authority: &str,
        packet: Packet,
    ) -> Result<HttpResponse> {
        let key = format!("{authority}{}", request.path);
        let queue = self.sync_stream(&key, authority, packet).await?;

        let idle_window = Duration::from_secs(self.config.observe_no_response_timeout_secs);
        let notification = {
            let mut queue = queue.lock().await;
            timeout(idle_window, queue.recv()).await
        };
        match notification {
            Ok(Some(packet)) => self.mapper.coap_to_http_response(&packet),
            Ok(None) => {
                self.streams.lock().await.remove(&key);
                Err(GatewayError::SessionClosed)
            }
            // Idle: keep the local long-poll client convinced the
            // connection is healthy.
            Err(_) => Ok(empty_sync_response(request.query_value("since"))),
        }
    }

    async fn sync_stream(
        &self,
        key: &str,
        authority: &str,
        packet: Packet,
    ) -> Result<Arc<Mutex<mpsc::Receiver<Packet>>>> {
        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get(key) {
            if !stream.session.is_closed() {
                return Ok(stream.queue.clone());
            }
            streams.remove(key);
        }

        let (session, last_token) = self.cache.get(authority).await?;
        let queue = session
            .observe_register(packet.clone(), self.config.observe_buffer_size)
            .await?;
        remember_token(&packet, &last_token).await;
        let queue = Arc::new(Mutex::new(queue));
        streams.insert(
            key.to_string(),
            SyncStream {
                session,
                queue: queue.clone(),
            },
        );
        Ok(queue)
    }
}

fn is_sync_path(path: &str) -> bool {
    path.trim_end_matches('/') == SYNC_PATH
}

/// Drop option 256 when its value matches the last token sent on the
/// session; the remote keeps the credential per relationship.
fn strip_repeated_token(packet: &Packet, last_token: &Option<String>) -> Packet {
    let current = option_token(packet);
    match (&current, last_token) {
        (Some(current), Some(last)) if current == last => {
            let mut stripped = packet.clone();
            stripped.clear_option(ACCESS_TOKEN_OPTION);
            stripped
        }
        _ => packet.clone(),
    }
}

async fn remember_token(packet: &Packet, last_token: &Arc<Mutex<Option<String>>>) {
    if let Some(token) = option_token(packet) {
        *last_token.lock().await = Some(token);
    }
}

fn option_token(packet: &Packet) -> Option<String> {
    packet
        .get_option(ACCESS_TOKEN_OPTION)
        .and_then(|options| options.front())
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

/// A sync response with no news: `next_batch` echoes the caller's `since`
/// and every collection is empty.
fn empty_sync_response(since: Option<&str>) -> HttpResponse {
    let body = serde_json::json!({
        "next_batch": since.unwrap_or(""),
        "rooms": {"join": {}, "invite": {}, "leave": {}},
        "presence": {"events": []},
        "account_data": {"events": []},
        "to_device": {"events": []},
        "device_lists": {"changed": [], "left": []},
    });
    HttpResponse::json(StatusCode::OK, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coap_lite::{CoapOption, MessageClass, MessageType, RequestType};

    fn request_packet(token_option: Option<&str>) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(RequestType::Get);
        packet.set_token(vec![0x01]);
        packet.add_option(CoapOption::UriPath, b"7".to_vec());
        if let Some(token) = token_option {
            packet.add_option(ACCESS_TOKEN_OPTION, token.as_bytes().to_vec());
        }
        packet
    }

    #[test]
    fn test_repeated_token_stripped() {
        let packet = request_packet(Some("syt_abc"));
        let stripped = strip_repeated_token(&packet, &Some("syt_abc".to_string()));
        assert!(stripped.get_option(ACCESS_TOKEN_OPTION).is_none());
    }

    #[test]
    fn test_changed_token_kept() {
        let packet = request_packet(Some("syt_new"));
        let kept = strip_repeated_token(&packet, &Some("syt_old".to_string()));
        assert_eq!(option_token(&kept).as_deref(), Some("syt_new"));
    }

    #[test]
    fn test_first_token_kept() {
        let packet = request_packet(Some("syt_abc"));
        let kept = strip_repeated_token(&packet, &None);
        assert_eq!(option_token(&kept).as_deref(), Some("syt_abc"));
    }

    #[test]
    fn test_empty_sync_response_echoes_since() {
        let response = empty_sync_response(Some("s72"));
        assert_eq!(response.status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&response.body).expect("json");
        assert_eq!(body["next_batch"], "s72");
        assert!(body["rooms"]["join"].as_object().expect("join").is_empty());
        assert!(body["to_device"]["events"].as_array().expect("events").is_empty());
    }

    #[test]
    fn test_sync_path_detection() {
        assert!(is_sync_path("/_matrix/client/r0/sync"));
        assert!(is_sync_path("/_matrix/client/r0/sync/"));
        assert!(!is_sync_path("/_matrix/client/r0/login"));
    }
}
