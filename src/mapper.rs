//! CoAP<->HTTP message mapping.
//!
//! Converts CoAP requests into HTTP requests for the homeserver and HTTP
//! responses back into CoAP responses (and the reverse for the client-side
//! proxy), composing the [`Codec`] for body transcoding and the [`PathMap`]
//! for path compression. Method and status mappings follow RFC 8075 §7.
//!
//! The bearer credential travels in the elective custom option 256 instead
//! of the query string, so it never leaks into cacheable URIs and repeat
//! transmissions can be deduplicated per session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use coap_lite::{
    CoapOption, ContentFormat, MessageClass, MessageType, Packet, RequestType, ResponseType,
};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tracing::warn;

use crate::codec::Codec;
use crate::paths::PathMap;
use crate::{GatewayError, Metrics, Result};

/// Custom CoAP option carrying the bearer credential (elective, unsafe to
/// forward per the CoAP option numbering rules).
pub const ACCESS_TOKEN_OPTION: CoapOption = CoapOption::Unknown(256);

/// A plain, cloneable HTTP request. `http::Request` is not `Clone`, and the
/// OBSERVE engine has to re-issue a mutated copy of the registration request
/// on every poll round.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    /// Flattened query pairs; repeated keys accumulate.
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Replace every occurrence of `key` with a single `key=value` pair.
    pub fn set_query(&mut self, key: &str, value: &str) {
        self.query.retain(|(k, _)| k != key);
        self.query.push((key.to_string(), value.to_string()));
    }

    /// First value for a query key.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The bearer token from the `Authorization` header, if any.
    pub fn bearer_token(&self) -> Option<String> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    }

    fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

/// A plain, cloneable HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// A JSON response with the matching `Content-Type`.
    pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response.body = body.to_string().into_bytes();
        response
    }

    fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

/// Source of CoAP tokens for outbound requests.
pub trait TokenSource: Send + Sync {
    fn next_token(&self) -> Vec<u8>;
}

/// Default token source: monotonically increasing unsigned varints.
#[derive(Debug)]
pub struct VarintTokenSource {
    next: AtomicU64,
}

impl VarintTokenSource {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }
}

impl Default for VarintTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenSource for VarintTokenSource {
    fn next_token(&self) -> Vec<u8> {
        uvarint(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

fn uvarint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(2);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// HTTP status for a CoAP response code; unknown codes fail the mapping.
pub fn response_type_to_status(code: ResponseType) -> Option<StatusCode> {
    match code {
        ResponseType::Content => Some(StatusCode::OK),
        ResponseType::BadRequest => Some(StatusCode::BAD_REQUEST),
        ResponseType::Unauthorized => Some(StatusCode::UNAUTHORIZED),
        ResponseType::Forbidden => Some(StatusCode::FORBIDDEN),
        ResponseType::NotFound => Some(StatusCode::NOT_FOUND),
        ResponseType::MethodNotAllowed => Some(StatusCode::METHOD_NOT_ALLOWED),
        ResponseType::RequestEntityTooLarge => Some(StatusCode::PAYLOAD_TOO_LARGE),
        ResponseType::UnsupportedContentFormat => Some(StatusCode::UNSUPPORTED_MEDIA_TYPE),
        ResponseType::InternalServerError => Some(StatusCode::INTERNAL_SERVER_ERROR),
        ResponseType::BadGateway => Some(StatusCode::BAD_GATEWAY),
        ResponseType::GatewayTimeout => Some(StatusCode::GATEWAY_TIMEOUT),
        _ => None,
    }
}

/// CoAP response code for an HTTP status; the reverse of
/// [`response_type_to_status`].
pub fn status_to_response_type(status: StatusCode) -> Option<ResponseType> {
    match status.as_u16() {
        200 => Some(ResponseType::Content),
        400 => Some(ResponseType::BadRequest),
        401 => Some(ResponseType::Unauthorized),
        403 => Some(ResponseType::Forbidden),
        404 => Some(ResponseType::NotFound),
        405 => Some(ResponseType::MethodNotAllowed),
        413 => Some(ResponseType::RequestEntityTooLarge),
        415 => Some(ResponseType::UnsupportedContentFormat),
        500 => Some(ResponseType::InternalServerError),
        502 => Some(ResponseType::BadGateway),
        504 => Some(ResponseType::GatewayTimeout),
        _ => None,
    }
}

fn method_to_request_type(method: &Method) -> Result<RequestType> {
    if *method == Method::GET {
        Ok(RequestType::Get)
    } else if *method == Method::POST {
        Ok(RequestType::Post)
    } else if *method == Method::PUT {
        Ok(RequestType::Put)
    } else if *method == Method::DELETE {
        Ok(RequestType::Delete)
    } else {
        Err(GatewayError::Mapping(format!("unknown method {method}")))
    }
}

fn request_type_to_method(code: RequestType) -> Result<Method> {
    match code {
        RequestType::Get => Ok(Method::GET),
        RequestType::Post => Ok(Method::POST),
        RequestType::Put => Ok(Method::PUT),
        RequestType::Delete => Ok(Method::DELETE),
        other => Err(GatewayError::Mapping(format!("unknown CoAP code {other:?}"))),
    }
}

fn content_type_to_format(content_type: &str) -> ContentFormat {
    let media = content_type.split(';').next().unwrap_or("").trim();
    match media {
        "application/json" => ContentFormat::ApplicationJSON,
        "application/cbor" => ContentFormat::ApplicationCBOR,
        "application/octet-stream" => ContentFormat::ApplicationOctetStream,
        "text/plain" => ContentFormat::TextPlain,
        _ => ContentFormat::ApplicationOctetStream,
    }
}

fn format_to_content_type(format: ContentFormat) -> Option<&'static str> {
    match format {
        ContentFormat::ApplicationJSON => Some("application/json"),
        ContentFormat::ApplicationCBOR => Some("application/cbor"),
        ContentFormat::ApplicationOctetStream => Some("application/octet-stream"),
        ContentFormat::TextPlain => Some("text/plain"),
        _ => None,
    }
}

/// The raw (possibly compressed) CoAP path of a message, with a leading `/`.
pub fn coap_path(packet: &Packet) -> String {
    let segments: Vec<String> = packet
        .get_option(CoapOption::UriPath)
        .map(|options| {
            options
                .iter()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .collect()
        })
        .unwrap_or_default();
    format!("/{}", segments.join("/"))
}

/// The message converter, composing [`Codec`] and [`PathMap`].
#[derive(Clone)]
pub struct Mapper {
    paths: Arc<PathMap>,
    codec: Codec,
    tokens: Arc<dyn TokenSource>,
    metrics: Arc<Metrics>,
}

impl Mapper {
    pub fn new(
        paths: Arc<PathMap>,
        codec: Codec,
        tokens: Arc<dyn TokenSource>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            paths,
            codec,
            tokens,
            metrics,
        }
    }

    /// Mapper over the v1 path table and key dictionary with the default
    /// token source.
    pub fn v1(metrics: Arc<Metrics>) -> Self {
        Self::new(
            PathMap::v1(),
            Codec::v1(false, metrics.clone()),
            Arc::new(VarintTokenSource::new()),
            metrics,
        )
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn paths(&self) -> &Arc<PathMap> {
        &self.paths
    }

    /// Convert an inbound CoAP request into the HTTP request to proxy.
    ///
    /// The compressed path is expanded, Uri-Query options accumulate into
    /// the query map (malformed items are skipped), option 256 becomes a
    /// bearer `Authorization` header and a CBOR body is transcoded to JSON.
    pub fn coap_to_http_request(&self, packet: &Packet) -> Result<HttpRequest> {
        let method = match packet.header.code {
            MessageClass::Request(code) => request_type_to_method(code)?,
            other => {
                return Err(GatewayError::Mapping(format!(
                    "message code {other} is not a request"
                )))
            }
        };
        let path = self.paths.coap_path_to_http_path(&coap_path(packet));
        let mut request = HttpRequest::new(method, path);

        if let Some(options) = packet.get_option(CoapOption::UriQuery) {
            for option in options {
                let item = String::from_utf8_lossy(option);
                match item.split_once('=') {
                    Some((key, value)) => {
                        request.query.push((key.to_string(), value.to_string()));
                    }
                    None => {
                        self.metrics
                            .skipped_query_items
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(item = %item, "skipping malformed Uri-Query option");
                    }
                }
            }
        }

        if let Some(options) = packet.get_option(ACCESS_TOKEN_OPTION) {
            if let Some(token) = options.front() {
                let value = format!("Bearer {}", String::from_utf8_lossy(token));
                request.headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&value)
                        .map_err(|e| GatewayError::Mapping(format!("bad access token: {e}")))?,
                );
            }
        }

        request.body = packet.payload.clone();
        match packet.get_content_format() {
            Some(ContentFormat::ApplicationCBOR) => {
                request.body = self.codec.cbor_to_json(&request.body)?;
                request
                    .headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            Some(format) => {
                if let Some(content_type) = format_to_content_type(format) {
                    request
                        .headers
                        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                }
            }
            None => {}
        }

        Ok(request)
    }

    /// Convert an outbound HTTP request into a confirmable CoAP request.
    ///
    /// The path is compressed, query pairs flatten into Uri-Query options,
    /// a JSON body is transcoded to CBOR and a bearer `Authorization`
    /// header moves into option 256.
    pub fn http_to_coap_request(&self, request: &HttpRequest) -> Result<Packet> {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(method_to_request_type(&request.method)?);
        packet.set_token(self.tokens.next_token());

        let coap_path = self.paths.http_path_to_coap_path(&request.path);
        for segment in coap_path.split('/').filter(|s| !s.is_empty()) {
            packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
        for (key, value) in &request.query {
            packet.add_option(CoapOption::UriQuery, format!("{key}={value}").into_bytes());
        }
        if let Some(token) = request.bearer_token() {
            packet.add_option(ACCESS_TOKEN_OPTION, token.into_bytes());
        }

        if !request.body.is_empty() {
            if request
                .content_type()
                .map(content_type_to_format)
                .unwrap_or(ContentFormat::ApplicationOctetStream)
                == ContentFormat::ApplicationJSON
            {
                packet.payload = self.codec.json_to_cbor(&request.body)?;
                packet.set_content_format(ContentFormat::ApplicationCBOR);
            } else {
                packet.payload = request.body.clone();
                packet.set_content_format(
                    request
                        .content_type()
                        .map(content_type_to_format)
                        .unwrap_or(ContentFormat::ApplicationOctetStream),
                );
            }
        }

        Ok(packet)
    }

    /// Convert an upstream HTTP response into the CoAP response payload.
    ///
    /// JSON bodies become CBOR here; this is the transcoding writer at the
    /// response boundary. Message type, id and token are the dispatcher's
    /// business. An HTTP status with no CoAP equivalent maps to `Empty`.
    pub fn http_to_coap_response(&self, response: &HttpResponse) -> Result<Packet> {
        let mut packet = Packet::new();
        packet.header.code = match status_to_response_type(response.status) {
            Some(code) => MessageClass::Response(code),
            None => {
                self.metrics.unknown_status.fetch_add(1, Ordering::Relaxed);
                warn!(status = %response.status, "no CoAP code for HTTP status");
                MessageClass::Empty
            }
        };

        if !response.body.is_empty() {
            if response
                .content_type()
                .map(content_type_to_format)
                .unwrap_or(ContentFormat::ApplicationOctetStream)
                == ContentFormat::ApplicationJSON
            {
                packet.payload = self.codec.json_to_cbor(&response.body)?;
                packet.set_content_format(ContentFormat::ApplicationCBOR);
            } else {
                packet.payload = response.body.clone();
                packet.set_content_format(
                    response
                        .content_type()
                        .map(content_type_to_format)
                        .unwrap_or(ContentFormat::ApplicationOctetStream),
                );
            }
        }

        Ok(packet)
    }

    /// Convert an inbound CoAP response into the HTTP response for the
    /// local caller, decoding CBOR back to JSON. Unknown CoAP codes fail.
    pub fn coap_to_http_response(&self, packet: &Packet) -> Result<HttpResponse> {
        let status = match packet.header.code {
            MessageClass::Response(code) => response_type_to_status(code).ok_or_else(|| {
                GatewayError::Mapping(format!("no HTTP status for CoAP code {code:?}"))
            })?,
            other => {
                return Err(GatewayError::Mapping(format!(
                    "message code {other} is not a response"
                )))
            }
        };
        let mut response = HttpResponse::new(status);
        response.body = packet.payload.clone();
        match packet.get_content_format() {
            Some(ContentFormat::ApplicationCBOR) => {
                response.body = self.codec.cbor_to_json(&response.body)?;
                response
                    .headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            Some(format) => {
                if let Some(content_type) = format_to_content_type(format) {
                    response
                        .headers
                        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                }
            }
            None => {}
        }
        Ok(response)
    }
}
