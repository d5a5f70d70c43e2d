//! OBSERVE state-machine behavior against a scripted upstream.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use http::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::{Method, StatusCode};
use tokio::sync::Mutex;

use coap_gateway::codec::Codec;
use coap_gateway::mapper::{HttpRequest, HttpResponse};
use coap_gateway::observe::{Observations, ObserveConfig, OBSERVE_SEQ_START, SYNC_PATH};
use coap_gateway::{GatewayError, Metrics, NotifySink, Result, Upstream};

/// Serves scripted responses for the sync path; every other path (and an
/// exhausted script) long-polls forever.
struct ScriptedUpstream {
    responses: Mutex<VecDeque<HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedUpstream {
    fn new(bodies: &[&str]) -> Arc<Self> {
        let responses = bodies
            .iter()
            .map(|body| {
                let mut response = HttpResponse::new(StatusCode::OK);
                response
                    .headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response.body = body.as_bytes().to_vec();
                response
            })
            .collect();
        Arc::new(Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        })
    }

    async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn handle(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().await.push(request.clone());
        if request.path == SYNC_PATH {
            if let Some(response) = self.responses.lock().await.pop_front() {
                return Ok(response);
            }
        }
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// Records pushed packets; optionally fails sends per a script.
#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Packet>>,
    failures: Mutex<VecDeque<bool>>,
}

impl RecordingSink {
    fn failing(script: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(script.iter().copied().collect()),
        })
    }

    async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl NotifySink for RecordingSink {
    async fn send(&self, packet: Packet) -> Result<()> {
        let fail = self.failures.lock().await.pop_front().unwrap_or(false);
        self.sent.lock().await.push(packet);
        if fail {
            Err(GatewayError::Reset)
        } else {
            Ok(())
        }
    }
}

fn observations(upstream: Arc<ScriptedUpstream>) -> Observations<ScriptedUpstream> {
    Observations::with_sync_defaults(
        upstream,
        Codec::v1(false, Arc::new(Metrics::default())),
        ObserveConfig::default(),
    )
}

fn sync_register_packet(token: &[u8]) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_type(MessageType::Confirmable);
    packet.header.code = MessageClass::Request(RequestType::Get);
    packet.header.message_id = 1;
    packet.set_token(token.to_vec());
    packet.add_option(CoapOption::UriPath, b"7".to_vec());
    packet.set_observe_value(0);
    packet
}

fn sync_http_request(bearer: &str) -> HttpRequest {
    let mut request = HttpRequest::new(Method::GET, SYNC_PATH);
    request.headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {bearer}")).expect("header"),
    );
    request
}

fn peer() -> SocketAddr {
    "10.0.0.9:5683".parse().expect("addr")
}

fn observe_seq(packet: &Packet) -> u32 {
    packet.get_observe_value().expect("observe option").expect("valid")
}

fn next_batch_of(packet: &Packet) -> String {
    let codec = Codec::v1(false, Arc::new(Metrics::default()));
    let json = codec.cbor_to_json(&packet.payload).expect("cbor");
    let value: serde_json::Value = serde_json::from_slice(&json).expect("json");
    value["next_batch"].as_str().expect("next_batch").to_string()
}

async fn wait_for_sends(sink: &RecordingSink, count: usize) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while sink.sent_count().await < count {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("sends did not arrive in time");
}

async fn wait_for_requests(upstream: &ScriptedUpstream, count: usize) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while upstream.request_count().await < count {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("polls did not arrive in time");
}

async fn wait_for_registration_count(
    observations: &Observations<ScriptedUpstream>,
    count: usize,
) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while observations.registration_count().await != count {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("registration count not reached in time");
}

#[tokio::test(start_paused = true)]
async fn test_suppressed_then_transmitted_notifications() {
    // Two consecutive bodies with the same next_batch, then a change.
    let upstream = ScriptedUpstream::new(&[
        r#"{"next_batch":"s1"}"#,
        r#"{"next_batch":"s1"}"#,
        r#"{"next_batch":"s2"}"#,
    ]);
    let observations = observations(upstream.clone());
    let sink = Arc::new(RecordingSink::default());

    observations
        .handle_registration(
            sync_http_request("syt_a"),
            sink.clone(),
            &sync_register_packet(&[0xaa]),
            peer(),
            true,
        )
        .await
        .expect("register");

    // Registration ACK + first notification + second notification.
    wait_for_sends(&sink, 3).await;
    // The fourth poll carries the new since token.
    wait_for_requests(&upstream, 4).await;

    let sent = sink.sent.lock().await;
    assert_eq!(
        sent[0].header.code,
        MessageClass::Response(ResponseType::Content)
    );
    assert_eq!(sent[0].header.get_type(), MessageType::Acknowledgement);

    // Exactly one notification for the first two identical bodies.
    assert_eq!(sent.len(), 3);
    assert_eq!(observe_seq(&sent[1]), OBSERVE_SEQ_START);
    assert_eq!(next_batch_of(&sent[1]), "s1");

    // Strictly increasing sequence numbers.
    assert_eq!(observe_seq(&sent[2]), OBSERVE_SEQ_START + 1);
    assert_eq!(next_batch_of(&sent[2]), "s2");
    drop(sent);

    let requests = upstream.requests.lock().await;
    assert_eq!(requests[0].query_value("since"), None);
    assert_eq!(requests[1].query_value("since"), Some("s1"));
    assert_eq!(requests[1].query_value("timeout"), Some("10000"));
    assert_eq!(requests[2].query_value("since"), Some("s1"));
    assert_eq!(requests[3].query_value("since"), Some("s2"));
}

#[tokio::test(start_paused = true)]
async fn test_register_then_deregister_leaves_nothing() {
    let upstream = ScriptedUpstream::new(&[]);
    let observations = observations(upstream.clone());
    let sink = Arc::new(RecordingSink::default());
    let packet = sync_register_packet(&[0xab]);

    observations
        .handle_registration(sync_http_request("syt_b"), sink.clone(), &packet, peer(), true)
        .await
        .expect("register");
    assert_eq!(observations.registration_count().await, 1);
    assert_eq!(observations.token_ref_count("syt_b").await, 1);

    observations
        .handle_registration(sync_http_request("syt_b"), sink.clone(), &packet, peer(), false)
        .await
        .expect("deregister");
    assert_eq!(observations.registration_count().await, 0);
    assert_eq!(observations.token_ref_count("syt_b").await, 0);

    let sent = sink.sent.lock().await;
    assert_eq!(
        sent.last().expect("deregister ack").header.code,
        MessageClass::Response(ResponseType::Deleted)
    );
}

#[tokio::test(start_paused = true)]
async fn test_registration_is_idempotent() {
    let upstream = ScriptedUpstream::new(&[]);
    let observations = observations(upstream.clone());
    let sink = Arc::new(RecordingSink::default());
    let packet = sync_register_packet(&[0xac]);

    for _ in 0..2 {
        observations
            .handle_registration(
                sync_http_request("syt_c"),
                sink.clone(),
                &packet,
                peer(),
                true,
            )
            .await
            .expect("register");
    }
    assert_eq!(observations.registration_count().await, 1);
    assert_eq!(observations.token_ref_count("syt_c").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_transmit_with_shared_token_recovers() {
    let upstream = ScriptedUpstream::new(&[
        r#"{"next_batch":"s1"}"#,
        r#"{"next_batch":"s1"}"#,
    ]);
    let observations = observations(upstream.clone());

    // A second registration holding the same (empty) access token, parked
    // on a path the upstream never answers; it only exists to keep the
    // ref count above one.
    let parked_sink = Arc::new(RecordingSink::default());
    let mut parked_packet = sync_register_packet(&[0xbb]);
    parked_packet.clear_option(CoapOption::UriPath);
    parked_packet.add_option(CoapOption::UriPath, b"parked".to_vec());
    observations
        .handle_registration(
            HttpRequest::new(Method::GET, "/parked"),
            parked_sink.clone(),
            &parked_packet,
            peer(),
            true,
        )
        .await
        .expect("register parked");

    let sink = RecordingSink::failing(&[false, true]);
    observations
        .handle_registration(
            sync_http_request(""),
            sink.clone(),
            &sync_register_packet(&[0xba]),
            peer(),
            true,
        )
        .await
        .expect("register");
    assert_eq!(observations.token_ref_count("").await, 2);

    // ACK, failed notification, retried notification after the backoff.
    wait_for_sends(&sink, 3).await;

    let sent = sink.sent.lock().await;
    // The retry keeps the un-advanced sequence number.
    assert_eq!(observe_seq(&sent[1]), OBSERVE_SEQ_START);
    assert_eq!(observe_seq(&sent[2]), OBSERVE_SEQ_START);
    assert_eq!(next_batch_of(&sent[2]), "s1");
    drop(sent);

    // prev was reverted to the pre-transmission snapshot, so the poll after
    // the failure starts over without a since token.
    let requests = upstream.requests.lock().await;
    let sync_requests: Vec<_> = requests.iter().filter(|r| r.path == SYNC_PATH).collect();
    assert!(sync_requests.len() >= 2);
    assert_eq!(sync_requests[0].query_value("since"), None);
    assert_eq!(sync_requests[1].query_value("since"), None);
    drop(requests);

    // Both registrations survive.
    assert_eq!(observations.registration_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_transmit_on_last_stream_removes_registration() {
    let upstream = ScriptedUpstream::new(&[r#"{"next_batch":"s1"}"#]);
    let observations = observations(upstream.clone());
    let sink = RecordingSink::failing(&[false, true]);

    observations
        .handle_registration(
            sync_http_request("syt_d"),
            sink.clone(),
            &sync_register_packet(&[0xcc]),
            peer(),
            true,
        )
        .await
        .expect("register");

    wait_for_registration_count(&observations, 0).await;
    assert_eq!(observations.token_ref_count("syt_d").await, 0);
    // ACK plus exactly the one failed notification.
    assert_eq!(sink.sent_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_upstream_error_status_sends_final_notification() {
    let upstream = ScriptedUpstream::new(&[]);
    {
        let mut responses = upstream.responses.lock().await;
        responses.push_back(HttpResponse::new(StatusCode::SERVICE_UNAVAILABLE));
    }
    let observations = observations(upstream.clone());
    let sink = Arc::new(RecordingSink::default());

    observations
        .handle_registration(
            sync_http_request("syt_e"),
            sink.clone(),
            &sync_register_packet(&[0xdd]),
            peer(),
            true,
        )
        .await
        .expect("register");

    wait_for_registration_count(&observations, 0).await;
    let sent = sink.sent.lock().await;
    assert_eq!(sent.len(), 2);
    // 503 has no table entry; the notification defaults to 5.02.
    assert_eq!(
        sent[1].header.code,
        MessageClass::Response(ResponseType::BadGateway)
    );
    assert!(sent[1].payload.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_blockwise_continuation_served_from_cache() {
    let upstream = ScriptedUpstream::new(&[r#"{"next_batch":"s1"}"#]);
    let observations = observations(upstream.clone());
    let sink = Arc::new(RecordingSink::default());

    observations
        .handle_registration(
            sync_http_request("syt_f"),
            sink.clone(),
            &sync_register_packet(&[0xee]),
            peer(),
            true,
        )
        .await
        .expect("register");
    wait_for_sends(&sink, 2).await;

    let mut continuation = Packet::new();
    continuation.header.set_type(MessageType::NonConfirmable);
    continuation.header.code = MessageClass::Request(RequestType::Get);
    continuation.header.message_id = 99;
    continuation.set_token(vec![0xef]);
    continuation.add_option(CoapOption::UriPath, b"7".to_vec());

    let blockwise_sink = Arc::new(RecordingSink::default());
    observations
        .handle_blockwise(blockwise_sink.clone(), &continuation, peer())
        .await
        .expect("blockwise");

    let sent = blockwise_sink.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].header.code,
        MessageClass::Response(ResponseType::Content)
    );
    assert_eq!(next_batch_of(&sent[0]), "s1");

    // A continuation for a peer we never served misses the cache.
    let other_sink = Arc::new(RecordingSink::default());
    let other_peer: SocketAddr = "10.0.0.10:5683".parse().expect("addr");
    observations
        .handle_blockwise(other_sink.clone(), &continuation, other_peer)
        .await
        .expect("blockwise miss");
    assert_eq!(
        other_sink.sent.lock().await[0].header.code,
        MessageClass::Response(ResponseType::NotFound)
    );
}
