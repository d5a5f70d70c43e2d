//! Client-side CoAP session runtime.
//!
//! A [`CoapSession`] owns one connected transport and a receive loop that
//! routes incoming messages by token: plain responses wake the matching
//! in-flight request, observe notifications land in a bounded per-token
//! queue (and are only acknowledged after they were queued, so a full queue
//! withholds the ACK and throttles the server). Confirmable requests are
//! retransmitted on an ACK timeout; an empty-message keepalive detects dead
//! peers.
//!
//! The transport itself is a seam: the gateway ships a plain UDP transport,
//! and a DTLS runtime can provide its own [`ClientTransport`] built from the
//! DTLS knobs in [`TransportConfig`].

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};

use coap_lite::{MessageClass, MessageType, Packet, ResponseType};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::{GatewayError, Result};

const RECV_BUFFER_SIZE: usize = 2048;

/// Default CoAP port when the authority does not carry one.
const COAP_DEFAULT_PORT: u16 = 5683;

/// A one-to-one datagram connection between this client and one server.
#[async_trait::async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

/// Plain UDP transport.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Connect a fresh socket to `authority` (`host[:port]`).
    pub async fn connect(authority: &str) -> Result<Self> {
        let target = with_default_port(authority);
        let peer = lookup_host(&target)
            .await?
            .next()
            .ok_or_else(|| GatewayError::Transport(format!("could not resolve {authority:?}")))?;
        let bind = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;
        Ok(Self { socket })
    }
}

#[async_trait::async_trait]
impl ClientTransport for UdpTransport {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf).await
    }
}

fn with_default_port(authority: &str) -> String {
    let has_port = authority
        .rsplit_once(':')
        .map(|(_, port)| port.parse::<u16>().is_ok())
        .unwrap_or(false);
    if has_port {
        authority.to_string()
    } else {
        format!("{authority}:{COAP_DEFAULT_PORT}")
    }
}

/// Builds sessions for the outbound connection cache.
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    async fn connect(&self, authority: &str, config: &TransportConfig) -> Result<Arc<CoapSession>>;
}

/// Factory for plain UDP sessions.
#[derive(Debug, Clone, Default)]
pub struct UdpSessionFactory;

#[async_trait::async_trait]
impl SessionFactory for UdpSessionFactory {
    async fn connect(&self, authority: &str, config: &TransportConfig) -> Result<Arc<CoapSession>> {
        let transport = UdpTransport::connect(authority).await?;
        Ok(CoapSession::spawn(Arc::new(transport), config.clone()))
    }
}

/// One live CoAP session over a connected transport.
pub struct CoapSession {
    transport: Arc<dyn ClientTransport>,
    /// In-flight requests by token.
    pending: StdMutex<HashMap<Vec<u8>, mpsc::UnboundedSender<Packet>>>,
    /// Observe notification queues by token.
    observers: StdMutex<HashMap<Vec<u8>, mpsc::Sender<Packet>>>,
    /// Message ids for which an empty ACK already arrived (separate
    /// response pending); suppresses pointless retransmissions.
    acked: StdMutex<HashSet<u16>>,
    ping_waiter: StdMutex<Option<(u16, oneshot::Sender<()>)>>,
    message_id: AtomicU16,
    nstart: Semaphore,
    config: TransportConfig,
    closed: watch::Sender<bool>,
}

impl CoapSession {
    /// Start the session over an established transport, spawning the
    /// receive and keepalive loops.
    pub fn spawn(transport: Arc<dyn ClientTransport>, config: TransportConfig) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            transport: transport.clone(),
            pending: StdMutex::new(HashMap::new()),
            observers: StdMutex::new(HashMap::new()),
            acked: StdMutex::new(HashSet::new()),
            ping_waiter: StdMutex::new(None),
            message_id: AtomicU16::new(rand::random()),
            nstart: Semaphore::new(config.transmission_nstart.max(1)),
            config,
            closed,
        });
        tokio::spawn(receive_loop(Arc::downgrade(&session), transport));
        tokio::spawn(keepalive_loop(Arc::downgrade(&session)));
        session
    }

    /// Send one request and wait for its response.
    ///
    /// Confirmable requests are retransmitted on an ACK timeout up to the
    /// configured budget; exhaustion closes the session.
    pub async fn request(&self, mut packet: Packet) -> Result<Packet> {
        if self.is_closed() {
            return Err(GatewayError::SessionClosed);
        }
        let permit = self
            .nstart
            .acquire()
            .await
            .map_err(|_| GatewayError::SessionClosed)?;
        if packet.header.message_id == 0 {
            packet.header.message_id = self.next_message_id();
        }
        let token = packet.get_token().to_vec();
        let (tx, mut rx) = mpsc::unbounded_channel();
        lock(&self.pending).insert(token.clone(), tx);

        let result = self.exchange(&packet, &mut rx).await;

        lock(&self.pending).remove(&token);
        lock(&self.acked).remove(&packet.header.message_id);
        drop(permit);
        result
    }

    /// Register an observe relationship; returns the bounded notification
    /// queue once the server accepted the registration.
    pub async fn observe_register(
        &self,
        mut packet: Packet,
        buffer: usize,
    ) -> Result<mpsc::Receiver<Packet>> {
        packet.set_observe_value(0);
        let token = packet.get_token().to_vec();
        let (tx, rx) = mpsc::channel(buffer.max(1));
        lock(&self.observers).insert(token.clone(), tx);
        match self.request(packet).await {
            Ok(response)
                if response.header.code == MessageClass::Response(ResponseType::Content) =>
            {
                Ok(rx)
            }
            Ok(response) => {
                lock(&self.observers).remove(&token);
                Err(GatewayError::Observe(format!(
                    "registration rejected with {}",
                    response.header.code
                )))
            }
            Err(e) => {
                lock(&self.observers).remove(&token);
                Err(e)
            }
        }
    }

    /// Cancel an observe relationship established with the same token.
    pub async fn observe_deregister(&self, mut packet: Packet) -> Result<()> {
        packet.set_observe_value(1);
        let token = packet.get_token().to_vec();
        let result = self.request(packet).await.map(|_| ());
        lock(&self.observers).remove(&token);
        result
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves when the session closes.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Tear the session down, waking every waiter with `SessionClosed`.
    pub fn close(&self) {
        let _ = self.closed.send(true);
        lock(&self.pending).clear();
        lock(&self.observers).clear();
    }

    async fn exchange(
        &self,
        packet: &Packet,
        rx: &mut mpsc::UnboundedReceiver<Packet>,
    ) -> Result<Packet> {
        let bytes = packet
            .to_bytes()
            .map_err(|e| GatewayError::Transport(format!("encoding failed: {e:?}")))?;
        let confirmable = packet.header.get_type() == MessageType::Confirmable;
        let attempts = if confirmable {
            self.config.transmission_max_retransmits + 1
        } else {
            1
        };

        for attempt in 0..attempts {
            if attempt == 0 || !lock(&self.acked).contains(&packet.header.message_id) {
                if let Err(e) = self.transport.send(&bytes).await {
                    self.close();
                    return Err(GatewayError::Transport(e.to_string()));
                }
            }
            match timeout(self.config.ack_timeout(), rx.recv()).await {
                Ok(Some(response)) => return Ok(response),
                Ok(None) => return Err(GatewayError::SessionClosed),
                Err(_) => trace!(attempt, "no response within ACK timeout"),
            }
        }
        self.close();
        Err(GatewayError::AckTimeout)
    }

    async fn dispatch(&self, packet: Packet) {
        match packet.header.code {
            MessageClass::Response(_) => {
                let token = packet.get_token().to_vec();
                // A piggybacked response that echoes the Observe option is
                // the registration reply, not a notification; notifications
                // arrive as their own confirmable or non-confirmable
                // messages.
                let is_notification = packet.get_observe_value().is_some()
                    && packet.header.get_type() != MessageType::Acknowledgement;
                if is_notification {
                    let observer = lock(&self.observers).get(&token).cloned();
                    if let Some(queue) = observer {
                        // Queue first, acknowledge second: a full queue
                        // withholds the ACK and the server backs off.
                        let confirmable =
                            packet.header.get_type() == MessageType::Confirmable;
                        let message_id = packet.header.message_id;
                        if queue.send(packet).await.is_err() {
                            lock(&self.observers).remove(&token);
                            return;
                        }
                        if confirmable {
                            self.send_empty(MessageType::Acknowledgement, message_id).await;
                        }
                        return;
                    }
                }
                let waiter = lock(&self.pending).get(&token).cloned();
                match waiter {
                    Some(tx) => {
                        if packet.header.get_type() == MessageType::Confirmable {
                            self.send_empty(MessageType::Acknowledgement, packet.header.message_id)
                                .await;
                        }
                        let _ = tx.send(packet);
                    }
                    None if packet.header.get_type() == MessageType::Confirmable => {
                        // Nobody wants this anymore; a Reset tells the
                        // server to forget the relationship.
                        debug!(token = %hex::encode(&token), "resetting unexpected response");
                        self.send_empty(MessageType::Reset, packet.header.message_id).await;
                    }
                    None => trace!("dropping unexpected response"),
                }
            }
            MessageClass::Empty => match packet.header.get_type() {
                MessageType::Acknowledgement => {
                    let mut acked = lock(&self.acked);
                    if acked.len() >= 1024 {
                        acked.clear();
                    }
                    acked.insert(packet.header.message_id);
                    drop(acked);
                    self.resolve_ping(packet.header.message_id);
                }
                MessageType::Reset => self.resolve_ping(packet.header.message_id),
                MessageType::Confirmable => {
                    // CoAP ping; pong is a Reset.
                    self.send_empty(MessageType::Reset, packet.header.message_id).await;
                }
                MessageType::NonConfirmable => {}
            },
            _ => trace!("ignoring non-response message on client session"),
        }
    }

    /// Answer the keepalive with either an ACK or the canonical RST pong.
    fn resolve_ping(&self, message_id: u16) {
        let mut waiter = lock(&self.ping_waiter);
        let matches = waiter
            .as_ref()
            .map(|(id, _)| *id == message_id)
            .unwrap_or(false);
        if matches {
            if let Some((_, tx)) = waiter.take() {
                let _ = tx.send(());
            }
        }
    }

    async fn ping(&self) -> bool {
        for _ in 0..=self.config.keepalive_max_retries {
            let message_id = self.next_message_id();
            let (tx, rx) = oneshot::channel();
            *lock(&self.ping_waiter) = Some((message_id, tx));

            let mut packet = Packet::new();
            packet.header.set_type(MessageType::Confirmable);
            packet.header.code = MessageClass::Empty;
            packet.header.message_id = message_id;
            let bytes = match packet.to_bytes() {
                Ok(bytes) => bytes,
                Err(_) => return false,
            };
            if self.transport.send(&bytes).await.is_err() {
                return false;
            }
            match timeout(self.config.keepalive_timeout(), rx).await {
                Ok(Ok(())) => return true,
                _ => debug!("keepalive ping unanswered"),
            }
        }
        false
    }

    async fn send_empty(&self, message_type: MessageType, message_id: u16) {
        let mut packet = Packet::new();
        packet.header.set_type(message_type);
        packet.header.code = MessageClass::Empty;
        packet.header.message_id = message_id;
        if let Ok(bytes) = packet.to_bytes() {
            let _ = self.transport.send(&bytes).await;
        }
    }

    fn next_message_id(&self) -> u16 {
        self.message_id.fetch_add(1, Ordering::Relaxed)
    }
}

async fn receive_loop(session: Weak<CoapSession>, transport: Arc<dyn ClientTransport>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let read = match transport.recv(&mut buf).await {
            Ok(read) => read,
            Err(e) => {
                warn!(error = %e, "session transport failed");
                if let Some(session) = session.upgrade() {
                    session.close();
                }
                return;
            }
        };
        let packet = match Packet::from_bytes(&buf[..read]) {
            Ok(packet) => packet,
            Err(_) => {
                trace!("malformed datagram");
                continue;
            }
        };
        let Some(session) = session.upgrade() else {
            return;
        };
        if session.is_closed() {
            return;
        }
        session.dispatch(packet).await;
    }
}

async fn keepalive_loop(session: Weak<CoapSession>) {
    let heartbeat = match session.upgrade() {
        Some(session) => session.config.heartbeat(),
        None => return,
    };
    loop {
        tokio::time::sleep(heartbeat).await;
        let Some(session) = session.upgrade() else {
            return;
        };
        if session.is_closed() {
            return;
        }
        if !session.ping().await {
            warn!("keepalive exhausted, closing session");
            session.close();
            return;
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
