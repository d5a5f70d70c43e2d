//! The OBSERVE long-poll engine.
//!
//! A constrained client registers once for `/7` (sync) with the CoAP
//! Observe option; the gateway then runs the HTTP long-poll against the
//! homeserver on the client's behalf and pushes only meaningful state
//! changes back as confirmable notifications with increasing sequence
//! numbers.
//!
//! Each registration owns one worker task modeled as an explicit state
//! machine (`Idle -> Polling -> PendingAck -> Idle`, with `Recovering` after
//! a failed transmission that must not lose the update, and `Closed` as the
//! only exit). Deregistration and shutdown cancel the worker through a
//! watch channel observed at every suspension point.
//!
//! The registration table, the access-token ref-counts and the
//! last-response cache form a single invariant and live behind one lock;
//! in particular "is it safe to remove this registration" and the removal
//! itself are a single critical section.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use coap_lite::{ContentFormat, MessageClass, MessageType, Packet, ResponseType};
use http::StatusCode;
use serde_json::Value as JsonValue;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::mapper::{self, status_to_response_type, HttpRequest};
use crate::{NotifySink, Result, Upstream};

/// First notification sequence number. 0 and 1 are taken by the
/// register/deregister option values on the inbound side; RFC 7641 §3.4
/// starts notifications above them.
pub const OBSERVE_SEQ_START: u32 = 2;

/// Sequence numbers wrap at 24 bits (the Observe option is three bytes).
const OBSERVE_SEQ_MASK: u32 = 0x00ff_ffff;

/// The long-poll endpoint that gets the special update predicate.
pub const SYNC_PATH: &str = "/_matrix/client/r0/sync";

/// Decides whether `curr` is worth a notification given `prev`.
pub type UpdatePredicate =
    Arc<dyn Fn(&str, Option<&JsonValue>, Option<&JsonValue>) -> bool + Send + Sync>;

/// Rewrites the next poll's request from the previous response.
pub type RequestMutator = Arc<dyn Fn(&str, Option<&JsonValue>, &mut HttpRequest) + Send + Sync>;

/// Update predicate for the sync endpoint: the first body is always an
/// update, later ones only when `next_batch` moved. Unknown paths treat
/// every response as an update.
pub fn sync_update_predicate() -> UpdatePredicate {
    Arc::new(|path, prev, curr| {
        if path.trim_end_matches('/') != SYNC_PATH {
            return true;
        }
        match (prev, curr) {
            (None, Some(_)) => true,
            (Some(prev), Some(curr)) => prev.get("next_batch") != curr.get("next_batch"),
            _ => false,
        }
    })
}

/// Request mutator for the sync endpoint: continue from the previous
/// `next_batch` and long-poll upstream for ten seconds.
pub fn sync_request_mutator() -> RequestMutator {
    Arc::new(|path, prev, request| {
        if path.trim_end_matches('/') != SYNC_PATH {
            return;
        }
        let next_batch = prev
            .and_then(|p| p.get("next_batch"))
            .and_then(JsonValue::as_str);
        if let Some(next_batch) = next_batch {
            request.set_query("since", next_batch);
            request.set_query("timeout", "10000");
        }
    })
}

/// Timing knobs for the poll loop.
#[derive(Debug, Clone, Copy)]
pub struct ObserveConfig {
    /// Pause between poll rounds.
    pub poll_interval: Duration,
    /// Backoff after a failed transmission that was kept alive because the
    /// access token has other live registrations.
    pub recover_backoff: Duration,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            recover_backoff: Duration::from_secs(60),
        }
    }
}

struct RegistrationEntry {
    access_token: String,
    /// Distinguishes this entry from a later one under the same id, so a
    /// stale worker cannot tear down its successor.
    generation: u64,
    /// Dropping this sender (by removing the entry) also cancels the worker.
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct ObserveState {
    registrations: HashMap<String, RegistrationEntry>,
    token_refs: HashMap<String, usize>,
    last_responses: HashMap<String, Vec<u8>>,
    next_generation: u64,
}

enum FailureAction {
    /// Other registrations share the access token; keep this one and back
    /// off instead of losing the update.
    Recover,
    /// This was the last stream for the token; the registration is gone.
    Removed,
}

/// The OBSERVE state machine and long-poll engine.
pub struct Observations<U> {
    upstream: Arc<U>,
    codec: Codec,
    state: Arc<Mutex<ObserveState>>,
    has_updated: UpdatePredicate,
    mutate: RequestMutator,
    cfg: ObserveConfig,
}

impl<U> Clone for Observations<U> {
    fn clone(&self) -> Self {
        Self {
            upstream: self.upstream.clone(),
            codec: self.codec.clone(),
            state: self.state.clone(),
            has_updated: self.has_updated.clone(),
            mutate: self.mutate.clone(),
            cfg: self.cfg,
        }
    }
}

impl<U: Upstream> Observations<U> {
    pub fn new(
        upstream: Arc<U>,
        codec: Codec,
        has_updated: UpdatePredicate,
        mutate: RequestMutator,
        cfg: ObserveConfig,
    ) -> Self {
        Self {
            upstream,
            codec,
            state: Arc::new(Mutex::new(ObserveState::default())),
            has_updated,
            mutate,
            cfg,
        }
    }

    /// Engine with the sync-endpoint predicate and mutator.
    pub fn with_sync_defaults(upstream: Arc<U>, codec: Codec, cfg: ObserveConfig) -> Self {
        Self::new(
            upstream,
            codec,
            sync_update_predicate(),
            sync_request_mutator(),
            cfg,
        )
    }

    /// Handle a confirmable request carrying an Observe option.
    ///
    /// `register == true` inserts a registration (idempotently) and starts
    /// its worker, acknowledging with Content; `register == false` removes
    /// it and acknowledges with Deleted.
    pub async fn handle_registration<S: NotifySink>(
        &self,
        request: HttpRequest,
        sink: Arc<S>,
        packet: &Packet,
        peer: SocketAddr,
        register: bool,
    ) -> Result<()> {
        let path = mapper::coap_path(packet);
        let id = registration_id(peer, &path, packet.get_token());

        if register {
            let access_token = request.bearer_token().unwrap_or_default();
            let mut state = self.state.lock().await;
            if state.registrations.contains_key(&id) {
                debug!(%id, "observe registration already present");
            } else {
                let (cancel_tx, cancel_rx) = watch::channel(false);
                state.next_generation += 1;
                let generation = state.next_generation;
                state.registrations.insert(
                    id.clone(),
                    RegistrationEntry {
                        access_token: access_token.clone(),
                        generation,
                        cancel: cancel_tx,
                    },
                );
                *state.token_refs.entry(access_token).or_insert(0) += 1;
                let worker = Worker {
                    observations: self.clone(),
                    id: id.clone(),
                    generation,
                    cache_key: cache_key(peer, &path),
                    http_path: request.path.clone(),
                    request,
                    sink: sink.clone(),
                    token: packet.get_token().to_vec(),
                    cancel: cancel_rx,
                };
                tokio::spawn(worker.run());
                info!(%id, "observe registration started");
            }
            drop(state);
            self.ack(&sink, packet, ResponseType::Content).await
        } else {
            let removed = self.remove_registration(&id).await;
            debug!(%id, removed, "observe deregistration");
            self.ack(&sink, packet, ResponseType::Deleted).await
        }
    }

    /// Answer a non-confirmable continuation GET from the last response
    /// pushed to that peer for that path, so the CoAP layer can resume
    /// block-wise transfer.
    pub async fn handle_blockwise<S: NotifySink>(
        &self,
        sink: Arc<S>,
        packet: &Packet,
        peer: SocketAddr,
    ) -> Result<()> {
        let path = mapper::coap_path(packet);
        let key = cache_key(peer, &path);
        let cached = self.state.lock().await.last_responses.get(&key).cloned();

        let mut reply = Packet::new();
        reply.header.set_type(MessageType::NonConfirmable);
        reply.header.message_id = packet.header.message_id;
        reply.set_token(packet.get_token().to_vec());
        match cached {
            Some(bytes) => {
                reply.header.code = MessageClass::Response(ResponseType::Content);
                reply.set_content_format(ContentFormat::ApplicationCBOR);
                reply.payload = bytes;
            }
            None => {
                warn!(%key, "no cached response for block-wise continuation");
                reply.header.code = MessageClass::Response(ResponseType::NotFound);
            }
        }
        sink.send(reply).await
    }

    /// Number of live registrations.
    pub async fn registration_count(&self) -> usize {
        self.state.lock().await.registrations.len()
    }

    /// Number of live registrations using `access_token`.
    pub async fn token_ref_count(&self, access_token: &str) -> usize {
        self.state
            .lock()
            .await
            .token_refs
            .get(access_token)
            .copied()
            .unwrap_or(0)
    }

    /// Cancel every registration and drain the caches.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for (id, entry) in state.registrations.drain() {
            debug!(%id, "cancelling registration on shutdown");
            let _ = entry.cancel.send(true);
        }
        state.token_refs.clear();
        state.last_responses.clear();
    }

    async fn ack<S: NotifySink>(
        &self,
        sink: &Arc<S>,
        packet: &Packet,
        code: ResponseType,
    ) -> Result<()> {
        let mut ack = Packet::new();
        ack.header.set_type(MessageType::Acknowledgement);
        ack.header.message_id = packet.header.message_id;
        ack.header.code = MessageClass::Response(code);
        ack.set_token(packet.get_token().to_vec());
        sink.send(ack).await
    }

    /// Remove a registration, returning whether it existed. Also drops the
    /// cancel sender, which wakes the worker.
    async fn remove_registration(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.registrations.remove(id) {
            Some(entry) => {
                let _ = entry.cancel.send(true);
                decrement_token(&mut state, &entry.access_token);
                true
            }
            None => false,
        }
    }

    /// Remove a registration only if it still belongs to the caller's
    /// generation, so a worker outlived by a re-registration under the
    /// same id leaves the newer entry alone.
    async fn remove_registration_owned(&self, id: &str, generation: u64) -> bool {
        let mut state = self.state.lock().await;
        let owned = state
            .registrations
            .get(id)
            .map(|entry| entry.generation == generation)
            .unwrap_or(false);
        if owned {
            if let Some(entry) = state.registrations.remove(id) {
                let _ = entry.cancel.send(true);
                decrement_token(&mut state, &entry.access_token);
            }
        }
        owned
    }

    /// Decide the fate of a registration whose notification failed. The
    /// check and the removal are one critical section so that two
    /// concurrent failures cannot both conclude they are not last.
    async fn on_transmit_failure(&self, id: &str, generation: u64) -> FailureAction {
        let mut state = self.state.lock().await;
        let access_token = match state.registrations.get(id) {
            Some(entry) if entry.generation == generation => entry.access_token.clone(),
            _ => return FailureAction::Removed,
        };
        let refs = state.token_refs.get(&access_token).copied().unwrap_or(0);
        if refs > 1 {
            FailureAction::Recover
        } else {
            if let Some(entry) = state.registrations.remove(id) {
                let _ = entry.cancel.send(true);
                decrement_token(&mut state, &entry.access_token);
            }
            FailureAction::Removed
        }
    }

    async fn store_last_response(&self, key: &str, bytes: Vec<u8>) {
        self.state
            .lock()
            .await
            .last_responses
            .insert(key.to_string(), bytes);
    }

    /// Best-effort JSON view of a stored body, which may be raw JSON or the
    /// CBOR we already transcoded for the wire.
    fn body_as_json(&self, bytes: &[u8]) -> Option<JsonValue> {
        if bytes.is_empty() {
            return None;
        }
        if bytes[0] == b'{' {
            serde_json::from_slice(bytes).ok()
        } else {
            self.codec
                .cbor_to_json(bytes)
                .ok()
                .and_then(|json| serde_json::from_slice(&json).ok())
        }
    }
}

fn decrement_token(state: &mut ObserveState, access_token: &str) {
    if let Some(count) = state.token_refs.get_mut(access_token) {
        *count -= 1;
        if *count == 0 {
            state.token_refs.remove(access_token);
        }
    }
}

fn registration_id(peer: SocketAddr, path: &str, token: &[u8]) -> String {
    format!("{peer}{path}@{}", hex::encode(token))
}

fn cache_key(peer: SocketAddr, path: &str) -> String {
    format!("{peer}{path}")
}

fn next_seq(seq: u32) -> u32 {
    (seq + 1) & OBSERVE_SEQ_MASK
}

enum PollState {
    Idle,
    Polling,
    PendingAck {
        body: Vec<u8>,
        snapshot: Option<Vec<u8>>,
    },
    Recovering,
    Closed,
}

/// One registration's long-poll worker.
struct Worker<U, S> {
    observations: Observations<U>,
    id: String,
    generation: u64,
    cache_key: String,
    /// Expanded HTTP path, fed to the predicate and the mutator.
    http_path: String,
    request: HttpRequest,
    sink: Arc<S>,
    token: Vec<u8>,
    cancel: watch::Receiver<bool>,
}

impl<U: Upstream, S: NotifySink> Worker<U, S> {
    async fn run(mut self) {
        let mut seq = OBSERVE_SEQ_START;
        let mut prev: Option<Vec<u8>> = None;
        let mut state = PollState::Polling;

        loop {
            state = match state {
                PollState::Idle => {
                    if self.wait(self.observations.cfg.poll_interval).await {
                        PollState::Closed
                    } else {
                        PollState::Polling
                    }
                }
                PollState::Polling => self.poll(&mut prev, seq).await,
                PollState::PendingAck { body, snapshot } => {
                    match self.transmit(&body, seq).await {
                        Ok(()) => {
                            seq = next_seq(seq);
                            PollState::Idle
                        }
                        Err(e) => {
                            warn!(id = %self.id, error = %e, "notification failed");
                            match self
                                .observations
                                .on_transmit_failure(&self.id, self.generation)
                                .await
                            {
                                FailureAction::Recover => {
                                    // Do not lose the update: poll again from
                                    // the pre-transmission body.
                                    prev = snapshot;
                                    PollState::Recovering
                                }
                                FailureAction::Removed => PollState::Closed,
                            }
                        }
                    }
                }
                PollState::Recovering => {
                    if self.wait(self.observations.cfg.recover_backoff).await {
                        PollState::Closed
                    } else {
                        PollState::Polling
                    }
                }
                PollState::Closed => break,
            };
        }

        self.observations
            .remove_registration_owned(&self.id, self.generation)
            .await;
        debug!(id = %self.id, "observe worker stopped");
    }

    async fn poll(&mut self, prev: &mut Option<Vec<u8>>, seq: u32) -> PollState {
        if self.cancelled() {
            return PollState::Closed;
        }
        let prev_json = prev
            .as_deref()
            .and_then(|bytes| self.observations.body_as_json(bytes));
        (self.observations.mutate)(&self.http_path, prev_json.as_ref(), &mut self.request);

        let response = tokio::select! {
            _ = self.cancel.changed() => return PollState::Closed,
            response = self.observations.upstream.handle(&self.request) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(id = %self.id, error = %e, "upstream poll failed");
                let _ = self
                    .transmit_with_code(&[], seq, ResponseType::BadGateway)
                    .await;
                return PollState::Closed;
            }
        };
        if response.status != StatusCode::OK {
            let code =
                status_to_response_type(response.status).unwrap_or(ResponseType::BadGateway);
            let _ = self.transmit_with_code(&[], seq, code).await;
            return PollState::Closed;
        }

        let curr = response.body;
        let curr_json = self.observations.body_as_json(&curr);
        let updated =
            (self.observations.has_updated)(&self.http_path, prev_json.as_ref(), curr_json.as_ref());
        if !updated {
            *prev = Some(curr);
            return PollState::Idle;
        }
        let snapshot = prev.take();
        *prev = Some(curr.clone());
        PollState::PendingAck {
            body: curr,
            snapshot,
        }
    }

    async fn transmit(&self, body: &[u8], seq: u32) -> Result<()> {
        self.transmit_with_code(body, seq, ResponseType::Content)
            .await
    }

    /// Push one notification and block until the client acknowledges.
    async fn transmit_with_code(&self, body: &[u8], seq: u32, code: ResponseType) -> Result<()> {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Response(code);
        packet.set_token(self.token.clone());
        packet.set_observe_value(seq);
        if !body.is_empty() {
            let payload = match self.observations.codec.json_to_cbor(body) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(id = %self.id, error = %e, "notification body is not JSON, sending raw");
                    body.to_vec()
                }
            };
            // Cache before sending so a block-wise continuation racing the
            // notification finds the bytes.
            self.observations
                .store_last_response(&self.cache_key, payload.clone())
                .await;
            packet.set_content_format(ContentFormat::ApplicationCBOR);
            packet.payload = payload;
        }
        self.sink.send(packet).await
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow() || self.cancel.has_changed().is_err()
    }

    async fn wait(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.changed() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_predicate() {
        let predicate = sync_update_predicate();
        let a = serde_json::json!({"next_batch": "s1"});
        let b = serde_json::json!({"next_batch": "s1"});
        let c = serde_json::json!({"next_batch": "s2"});
        assert!(predicate(SYNC_PATH, None, Some(&a)));
        assert!(!predicate(SYNC_PATH, Some(&a), Some(&b)));
        assert!(predicate(SYNC_PATH, Some(&a), Some(&c)));
        assert!(!predicate(SYNC_PATH, Some(&a), None));
        assert!(!predicate(SYNC_PATH, None, None));
        // Unknown paths always update.
        assert!(predicate("/elsewhere", Some(&a), Some(&b)));
    }

    #[test]
    fn test_sync_mutator() {
        let mutate = sync_request_mutator();
        let mut request = HttpRequest::new(http::Method::GET, SYNC_PATH);
        let prev = serde_json::json!({"next_batch": "s9"});

        mutate(SYNC_PATH, None, &mut request);
        assert_eq!(request.query_value("since"), None);

        mutate(SYNC_PATH, Some(&prev), &mut request);
        assert_eq!(request.query_value("since"), Some("s9"));
        assert_eq!(request.query_value("timeout"), Some("10000"));

        let mut other = HttpRequest::new(http::Method::GET, "/elsewhere");
        mutate("/elsewhere", Some(&prev), &mut other);
        assert!(other.query.is_empty());
    }

    #[test]
    fn test_registration_id_shape() {
        let peer: SocketAddr = "127.0.0.1:5683".parse().expect("addr");
        assert_eq!(
            registration_id(peer, "/7", &[0x01, 0xff]),
            "127.0.0.1:5683/7@01ff"
        );
        assert_eq!(cache_key(peer, "/7"), "127.0.0.1:5683/7");
    }

    #[test]
    fn test_sequence_wraps_at_24_bits() {
        assert_eq!(next_seq(2), 3);
        assert_eq!(next_seq(0x00ff_ffff), 0);
    }
}
