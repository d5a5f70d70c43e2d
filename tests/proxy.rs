//! Client-proxy behavior over an in-memory transport.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use coap_lite::{CoapOption, ContentFormat, MessageClass, MessageType, Packet, ResponseType};
use http::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::{Method, StatusCode};
use tokio::sync::{mpsc, oneshot, Mutex};

use coap_gateway::client::ClientProxy;
use coap_gateway::codec::Codec;
use coap_gateway::config::{GatewayConfig, TransportConfig};
use coap_gateway::mapper::{HttpRequest, Mapper, ACCESS_TOKEN_OPTION};
use coap_gateway::session::{ClientTransport, CoapSession, SessionFactory};
use coap_gateway::{GatewayError, Metrics, Result};

struct MemoryTransport {
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl ClientTransport for MemoryTransport {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(datagram) => {
                buf[..datagram.len()].copy_from_slice(&datagram);
                Ok(datagram.len())
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")),
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
        Ok(buf.len())
    }
}

fn transport_pair() -> (
    MemoryTransport,
    mpsc::UnboundedReceiver<Vec<u8>>,
    mpsc::UnboundedSender<Vec<u8>>,
) {
    let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
    let (from_peer_tx, from_peer_rx) = mpsc::unbounded_channel();
    let transport = MemoryTransport {
        rx: Mutex::new(from_peer_rx),
        tx: to_peer_tx,
    };
    (transport, to_peer_rx, from_peer_tx)
}

/// Hands out pre-wired transports; an empty pool means "unreachable".
struct MemoryFactory {
    transports: Mutex<VecDeque<MemoryTransport>>,
}

impl MemoryFactory {
    fn with(transports: Vec<MemoryTransport>) -> Self {
        Self {
            transports: Mutex::new(transports.into_iter().collect()),
        }
    }
}

#[async_trait]
impl SessionFactory for MemoryFactory {
    async fn connect(&self, authority: &str, config: &TransportConfig) -> Result<Arc<CoapSession>> {
        match self.transports.lock().await.pop_front() {
            Some(transport) => Ok(CoapSession::spawn(Arc::new(transport), config.clone())),
            None => Err(GatewayError::Transport(format!("no route to {authority}"))),
        }
    }
}

fn proxy(factory: MemoryFactory, observe_enabled: bool) -> ClientProxy<MemoryFactory> {
    let mut config = GatewayConfig::default();
    config.observe_enabled = observe_enabled;
    ClientProxy::new(Mapper::v1(Arc::new(Metrics::default())), factory, config)
}

fn cbor_body(json: &[u8]) -> Vec<u8> {
    Codec::v1(false, Arc::new(Metrics::default()))
        .json_to_cbor(json)
        .expect("cbor")
}

/// Answers every request with a piggybacked Content response carrying a
/// fixed CBOR body, recording the requests it saw.
async fn run_echo_peer(
    mut from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    requests: Arc<Mutex<Vec<Packet>>>,
) {
    let body = cbor_body(br#"{"ok":true}"#);
    while let Some(datagram) = from_client.recv().await {
        let packet = Packet::from_bytes(&datagram).expect("decode");
        if !matches!(packet.header.code, MessageClass::Request(_)) {
            continue;
        }
        requests.lock().await.push(packet.clone());
        let mut response = Packet::new();
        response.header.set_type(MessageType::Acknowledgement);
        response.header.message_id = packet.header.message_id;
        response.header.code = MessageClass::Response(ResponseType::Content);
        response.set_token(packet.get_token().to_vec());
        response.set_content_format(ContentFormat::ApplicationCBOR);
        response.payload = body.clone();
        let _ = to_client.send(response.to_bytes().expect("encode"));
    }
}

#[tokio::test]
async fn test_forward_decodes_response_and_dedups_token() {
    let (transport, to_peer, from_peer) = transport_pair();
    let proxy = proxy(MemoryFactory::with(vec![transport]), false);
    let requests = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(run_echo_peer(to_peer, from_peer, requests.clone()));

    let mut request = HttpRequest::new(Method::GET, "/_matrix/client/r0/devices");
    request
        .headers
        .insert(AUTHORIZATION, HeaderValue::from_static("Bearer syt_tok"));

    let response = proxy.forward(request.clone(), "gateway.example").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, br#"{"ok":true}"#);
    assert_eq!(
        response
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/json")
    );

    let response = proxy.forward(request, "gateway.example").await;
    assert_eq!(response.status, StatusCode::OK);

    let recorded = requests.lock().await;
    assert_eq!(recorded.len(), 2);
    // First request carries the credential; the repeat is deduplicated.
    assert!(recorded[0].get_option(ACCESS_TOKEN_OPTION).is_some());
    assert!(recorded[1].get_option(ACCESS_TOKEN_OPTION).is_none());
    // The path went out compressed to its single enum code.
    let path_options = recorded[0]
        .get_option(CoapOption::UriPath)
        .expect("uri-path");
    assert_eq!(path_options.len(), 1);
    assert_eq!(path_options.front().map(Vec::as_slice), Some(&b"a"[..]));
}

#[tokio::test]
async fn test_unreachable_gateway_returns_proxy_error() {
    let proxy = proxy(MemoryFactory::with(vec![]), false);
    let response = proxy
        .forward(
            HttpRequest::new(Method::GET, "/_matrix/client/versions"),
            "nowhere.example",
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = serde_json::from_slice(&response.body).expect("json");
    assert_eq!(body["errcode"], "PROXY");
    assert!(body["error"].as_str().expect("error").contains("no route"));
}

#[tokio::test(start_paused = true)]
async fn test_sync_long_poll_over_observe() {
    let (transport, mut to_peer, from_peer) = transport_pair();
    let proxy = proxy(MemoryFactory::with(vec![transport]), true);

    // Peer: accept the observe registration, hand the token back to the
    // test body, then swallow the client's notification ACKs.
    let (token_tx, token_rx) = oneshot::channel();
    let ack_tx = from_peer.clone();
    tokio::spawn(async move {
        let datagram = to_peer.recv().await.expect("register");
        let packet = Packet::from_bytes(&datagram).expect("decode");
        assert_eq!(packet.get_observe_value(), Some(Ok(0)));
        assert!(packet.get_option(ACCESS_TOKEN_OPTION).is_some());

        let mut ack = Packet::new();
        ack.header.set_type(MessageType::Acknowledgement);
        ack.header.message_id = packet.header.message_id;
        ack.header.code = MessageClass::Response(ResponseType::Content);
        ack.set_token(packet.get_token().to_vec());
        let _ = ack_tx.send(ack.to_bytes().expect("encode"));
        let _ = token_tx.send(packet.get_token().to_vec());

        while to_peer.recv().await.is_some() {}
    });

    let mut request = HttpRequest::new(Method::GET, "/_matrix/client/r0/sync");
    request.set_query("since", "s0");
    request
        .headers
        .insert(AUTHORIZATION, HeaderValue::from_static("Bearer syt_tok"));

    // Idle stream: the proxy synthesizes an empty sync echoing `since`.
    let response = proxy.forward(request.clone(), "gateway.example").await;
    assert_eq!(response.status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&response.body).expect("json");
    assert_eq!(body["next_batch"], "s0");
    assert!(body["rooms"]["join"].as_object().expect("join").is_empty());

    // A pushed notification satisfies the next long-poll.
    let token = token_rx.await.expect("token");
    let mut notification = Packet::new();
    notification.header.set_type(MessageType::Confirmable);
    notification.header.message_id = 500;
    notification.header.code = MessageClass::Response(ResponseType::Content);
    notification.set_token(token);
    notification.set_observe_value(2);
    notification.set_content_format(ContentFormat::ApplicationCBOR);
    notification.payload = cbor_body(br#"{"next_batch":"s1"}"#);
    from_peer
        .send(notification.to_bytes().expect("encode"))
        .expect("push");

    let response = proxy.forward(request, "gateway.example").await;
    assert_eq!(response.status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&response.body).expect("json");
    assert_eq!(body["next_batch"], "s1");
}
