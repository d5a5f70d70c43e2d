//! UDP server runtime.
//!
//! Binds the [`Gateway`] dispatcher to a datagram socket. Each inbound
//! request is handled on its own task with a [`UdpSink`] pointed back at
//! the peer; ACKs and Resets for our own confirmable pushes (observe
//! notifications, separate responses) are routed to the waiting sender by
//! message id.
//!
//! A DTLS-terminating runtime can sit in front of this loop; the dispatcher
//! only ever sees decrypted CoAP packets and a sink.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use coap_lite::{MessageClass, MessageType, Packet};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::gateway::Gateway;
use crate::{GatewayError, NotifySink, Result, Upstream};

const RECV_BUFFER_SIZE: usize = 2048;

/// Waiters for transport-level ACK/RST, keyed by message id.
#[derive(Default)]
pub struct AckRegistry {
    waiters: StdMutex<HashMap<u16, mpsc::UnboundedSender<bool>>>,
}

impl AckRegistry {
    fn register(&self, message_id: u16) -> mpsc::UnboundedReceiver<bool> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.waiters).insert(message_id, tx);
        rx
    }

    fn deregister(&self, message_id: u16) {
        lock(&self.waiters).remove(&message_id);
    }

    /// Wake the waiter for `message_id`; `acknowledged` is false for Reset.
    fn resolve(&self, message_id: u16, acknowledged: bool) {
        if let Some(tx) = lock(&self.waiters).remove(&message_id) {
            let _ = tx.send(acknowledged);
        } else {
            trace!(message_id, "no waiter for ACK");
        }
    }
}

/// Packet sink for one peer over the shared server socket.
pub struct UdpSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    acks: Arc<AckRegistry>,
    message_id: Arc<AtomicU16>,
    config: TransportConfig,
}

#[async_trait::async_trait]
impl NotifySink for UdpSink {
    async fn send(&self, mut packet: Packet) -> Result<()> {
        if packet.header.message_id == 0 {
            packet.header.message_id = self.message_id.fetch_add(1, Ordering::Relaxed);
        }
        let message_id = packet.header.message_id;
        let bytes = packet
            .to_bytes()
            .map_err(|e| GatewayError::Transport(format!("encoding failed: {e:?}")))?;

        if packet.header.get_type() != MessageType::Confirmable {
            self.socket.send_to(&bytes, self.peer).await?;
            return Ok(());
        }

        let mut acked = self.acks.register(message_id);
        for attempt in 0..=self.config.transmission_max_retransmits {
            if let Err(e) = self.socket.send_to(&bytes, self.peer).await {
                self.acks.deregister(message_id);
                return Err(e.into());
            }
            match timeout(self.config.ack_timeout(), acked.recv()).await {
                Ok(Some(true)) => return Ok(()),
                Ok(Some(false)) => return Err(GatewayError::Reset),
                Ok(None) => return Err(GatewayError::Transport("ACK waiter dropped".to_string())),
                Err(_) => trace!(message_id, attempt, "no ACK, retransmitting"),
            }
        }
        self.acks.deregister(message_id);
        Err(GatewayError::AckTimeout)
    }
}

/// The CoAP server loop.
pub struct UdpGatewayServer<U> {
    socket: Arc<UdpSocket>,
    gateway: Arc<Gateway<U>>,
    acks: Arc<AckRegistry>,
    message_id: Arc<AtomicU16>,
    config: TransportConfig,
}

impl<U: Upstream> UdpGatewayServer<U> {
    pub async fn bind(
        addr: &str,
        gateway: Arc<Gateway<U>>,
        config: TransportConfig,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            gateway,
            acks: Arc::new(AckRegistry::default()),
            message_id: Arc::new(AtomicU16::new(rand::random())),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn gateway(&self) -> &Arc<Gateway<U>> {
        &self.gateway
    }

    /// Receive datagrams forever, dispatching each request on its own task.
    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (read, peer) = self.socket.recv_from(&mut buf).await?;
            let packet = match Packet::from_bytes(&buf[..read]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(%peer, error = ?e, "dropping malformed datagram");
                    continue;
                }
            };

            match packet.header.get_type() {
                // Transport-level replies to our own confirmable pushes.
                MessageType::Acknowledgement | MessageType::Reset => {
                    let acknowledged =
                        packet.header.get_type() == MessageType::Acknowledgement;
                    self.acks.resolve(packet.header.message_id, acknowledged);
                    continue;
                }
                // CoAP ping: pong with a Reset.
                MessageType::Confirmable if packet.header.code == MessageClass::Empty => {
                    let mut pong = Packet::new();
                    pong.header.set_type(MessageType::Reset);
                    pong.header.code = MessageClass::Empty;
                    pong.header.message_id = packet.header.message_id;
                    if let Ok(bytes) = pong.to_bytes() {
                        let _ = self.socket.send_to(&bytes, peer).await;
                    }
                    continue;
                }
                _ => {}
            }

            let sink = Arc::new(UdpSink {
                socket: self.socket.clone(),
                peer,
                acks: self.acks.clone(),
                message_id: self.message_id.clone(),
                config: self.config.clone(),
            });
            let gateway = self.gateway.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_packet(packet, peer, sink).await {
                    warn!(%peer, error = %e, "request handling failed");
                }
            });
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_registry_resolves_once() {
        let registry = AckRegistry::default();
        let mut rx = registry.register(7);
        registry.resolve(7, true);
        assert_eq!(rx.try_recv().ok(), Some(true));
        // Second resolve finds no waiter.
        registry.resolve(7, true);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ack_registry_reset_is_false() {
        let registry = AckRegistry::default();
        let mut rx = registry.register(9);
        registry.resolve(9, false);
        assert_eq!(rx.try_recv().ok(), Some(false));
    }
}
