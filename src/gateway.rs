//! Server-side façade: CoAP in, HTTP out.
//!
//! A single dispatcher receives every inbound CoAP message. Confirmable
//! messages without an Observe option are proxied to the homeserver and
//! answered with the transcoded response; messages with an Observe option
//! go to the [`Observations`] engine; non-confirmable messages are treated
//! as block-wise continuations against the last-response cache.
//!
//! If the upstream takes longer than the piggyback window, a timer fires an
//! early empty ACK and the eventual response goes out as a separate
//! confirmable message. A single atomic `processed` flag decides who sends
//! first; the loser of the race does nothing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use coap_lite::{MessageClass, MessageType, Packet, ResponseType};
use http::StatusCode;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::GatewayConfig;
use crate::mapper::{self, HttpRequest, HttpResponse, Mapper};
use crate::observe::Observations;
use crate::{GatewayError, NotifySink, Result, Upstream};

/// The server-side gateway.
pub struct Gateway<U> {
    mapper: Mapper,
    observations: Observations<U>,
    upstream: Arc<U>,
    piggyback_window: Duration,
}

impl<U: Upstream> Gateway<U> {
    pub fn new(
        mapper: Mapper,
        observations: Observations<U>,
        upstream: Arc<U>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            mapper,
            observations,
            upstream,
            piggyback_window: Duration::from_secs(config.piggyback_ack_window_secs),
        }
    }

    pub fn observations(&self) -> &Observations<U> {
        &self.observations
    }

    /// Dispatch one inbound CoAP message.
    #[instrument(
        skip_all,
        fields(
            coap_code = %packet.header.code,
            coap_path = %mapper::coap_path(&packet),
            %peer,
        )
    )]
    pub async fn handle_packet<S: NotifySink>(
        &self,
        packet: Packet,
        peer: SocketAddr,
        sink: Arc<S>,
    ) -> Result<()> {
        match packet.header.get_type() {
            MessageType::NonConfirmable => {
                self.observations.handle_blockwise(sink, &packet, peer).await
            }
            MessageType::Confirmable => match packet.get_observe_value() {
                None => self.proxy_request(packet, sink).await,
                Some(Ok(flag)) if flag <= 1 => {
                    let request = match self.mapper.coap_to_http_request(&packet) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!(error = %e, "failed to map observe request");
                            return self
                                .reply_error(&packet, sink, ResponseType::InternalServerError)
                                .await;
                        }
                    };
                    self.observations
                        .handle_registration(request, sink, &packet, peer, flag == 0)
                        .await
                }
                Some(_) => {
                    warn!("unsupported Observe option value");
                    self.reply_error(&packet, sink, ResponseType::BadOption).await
                }
            },
            // ACKs and Resets for our own confirmable pushes are routed by
            // the transport runtime, not by the dispatcher.
            MessageType::Acknowledgement | MessageType::Reset => Ok(()),
        }
    }

    /// Proxy one plain request to the homeserver.
    async fn proxy_request<S: NotifySink>(&self, packet: Packet, sink: Arc<S>) -> Result<()> {
        let processed = Arc::new(AtomicBool::new(false));
        self.spawn_early_ack(&packet, &sink, processed.clone());

        let response = match self.mapper.coap_to_http_request(&packet) {
            Ok(request) => match self.upstream.handle(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "upstream request failed");
                    proxy_failure_response(&e)
                }
            },
            Err(e @ GatewayError::Transcode(_)) => {
                warn!(error = %e, "request body transcoding failed");
                proxy_failure_response(&e)
            }
            Err(e) => {
                warn!(error = %e, "request mapping failed");
                HttpResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };

        let mut reply = self
            .mapper
            .http_to_coap_response(&response)
            .or_else(|e| {
                warn!(error = %e, "response body transcoding failed");
                self.mapper.http_to_coap_response(&proxy_failure_response(&e))
            })
            .unwrap_or_else(|_| {
                let mut fallback = Packet::new();
                fallback.header.code = MessageClass::Response(ResponseType::BadGateway);
                fallback
            });
        reply.set_token(packet.get_token().to_vec());

        if processed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // The upstream beat the timer; piggyback the ACK.
            reply.header.set_type(MessageType::Acknowledgement);
            reply.header.message_id = packet.header.message_id;
            sink.send(reply).await
        } else {
            // The early ACK already went out; push a separate response.
            reply.header.set_type(MessageType::Confirmable);
            sink.send(reply).await
        }
    }

    /// Arm the early-ACK timer for a slow upstream round-trip.
    fn spawn_early_ack<S: NotifySink>(
        &self,
        packet: &Packet,
        sink: &Arc<S>,
        processed: Arc<AtomicBool>,
    ) {
        let message_id = packet.header.message_id;
        let window = self.piggyback_window;
        let sink = sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if processed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let mut ack = Packet::new();
                ack.header.set_type(MessageType::Acknowledgement);
                ack.header.message_id = message_id;
                ack.header.code = MessageClass::Empty;
                debug!(message_id, "sending early empty ACK");
                if let Err(e) = sink.send(ack).await {
                    debug!(error = %e, "early ACK send failed");
                }
            }
        });
    }

    async fn reply_error<S: NotifySink>(
        &self,
        packet: &Packet,
        sink: Arc<S>,
        code: ResponseType,
    ) -> Result<()> {
        let mut reply = Packet::new();
        reply.header.set_type(MessageType::Acknowledgement);
        reply.header.message_id = packet.header.message_id;
        reply.header.code = MessageClass::Response(code);
        reply.set_token(packet.get_token().to_vec());
        sink.send(reply).await
    }
}

/// The error body the gateway hands back when it, not the origin, failed.
pub fn proxy_failure_response(error: &GatewayError) -> HttpResponse {
    HttpResponse::json(
        StatusCode::BAD_GATEWAY,
        &serde_json::json!({
            "errcode": "PROXY",
            "error": error.to_string(),
        }),
    )
}

/// The homeserver, reached over plain HTTP with `reqwest`.
pub struct HttpOrigin {
    base: Url,
    client: reqwest::Client,
}

impl HttpOrigin {
    pub fn new(base: &str) -> Result<Self> {
        let base = Url::parse(base)
            .map_err(|e| GatewayError::Config(format!("bad homeserver URL {base:?}: {e}")))?;
        Ok(Self {
            base,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait::async_trait]
impl Upstream for HttpOrigin {
    async fn handle(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut url = self
            .base
            .join(&request.path)
            .map_err(|e| GatewayError::Mapping(format!("bad path {:?}: {e}", request.path)))?;
        if !request.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(request.query.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish();
        }

        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| GatewayError::Mapping(format!("bad method: {e}")))?;
        let mut builder = self
            .client
            .request(method, url)
            .body(Bytes::copy_from_slice(&request.body));
        for (name, value) in &request.headers {
            if let Ok(value) = value.to_str() {
                builder = builder.header(name.as_str(), value);
            }
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        let mut out = HttpResponse::new(status);
        for (name, value) in response.headers() {
            let name = http::header::HeaderName::from_bytes(name.as_str().as_bytes());
            let value = http::HeaderValue::from_bytes(value.as_bytes());
            if let (Ok(name), Ok(value)) = (name, value) {
                out.headers.insert(name, value);
            }
        }
        out.body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?
            .to_vec();
        Ok(out)
    }
}
