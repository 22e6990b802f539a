//! UDP transport.
//!
//! Each envelope is one JSON datagram. UDP has no connections, so loss is
//! only ever detected by heartbeats; `ConnectionLost` is never emitted.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use concord_common::constants::MAX_DATAGRAM_SIZE;
use concord_common::{Address, ClusterError, ClusterResult, Envelope};

use super::{EVENT_CHANNEL_CAPACITY, EventReceiver, Transport, TransportEvent};

/// JSON-over-UDP transport
pub struct UdpTransport {
    address: Address,
    socket: Arc<UdpSocket>,
    broadcast_target: Option<SocketAddr>,
}

impl UdpTransport {
    /// Bind the socket and start the receive loop.
    ///
    /// `advertise` overrides the address announced to peers (needed when
    /// binding a wildcard address). The receive loop stops once the returned
    /// receiver is dropped.
    pub async fn bind(
        bind_addr: SocketAddr,
        advertise: Option<SocketAddr>,
        broadcast_target: Option<SocketAddr>,
    ) -> ClusterResult<(Arc<Self>, EventReceiver)> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ClusterError::Transport(format!("failed to bind {bind_addr}: {e}")))?;

        if broadcast_target.is_some() {
            socket
                .set_broadcast(true)
                .map_err(|e| ClusterError::Transport(format!("failed to enable broadcast: {e}")))?;
        }

        let local = socket
            .local_addr()
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        let address = Address::new(advertise.unwrap_or(local));

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(receive_loop(socket.clone(), tx));

        tracing::info!(%address, bind = %local, "UDP transport bound");

        Ok((
            Arc::new(Self {
                address,
                socket,
                broadcast_target,
            }),
            rx,
        ))
    }

    async fn send_datagram(&self, target: SocketAddr, envelope: &Envelope) -> ClusterResult<()> {
        let bytes = serde_json::to_vec(envelope)
            .map_err(|e| ClusterError::Transport(format!("failed to encode envelope: {e}")))?;

        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ClusterError::Transport(format!(
                "envelope of {} bytes exceeds datagram limit",
                bytes.len()
            )));
        }

        self.socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| ClusterError::Transport(format!("send to {target} failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_address(&self) -> Address {
        self.address
    }

    async fn send(&self, to: Address, envelope: Envelope) -> ClusterResult<()> {
        self.send_datagram(to.socket_addr(), &envelope).await
    }

    async fn broadcast(&self, envelope: Envelope) -> ClusterResult<()> {
        let target = self.broadcast_target.ok_or_else(|| {
            ClusterError::Transport("no broadcast target configured".to_string())
        })?;
        self.send_datagram(target, &envelope).await
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, events: mpsc::Sender<TransportEvent>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        let envelope: Envelope = match serde_json::from_slice(&buf[..len]) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                tracing::warn!(%src, error = %e, "Invalid cluster datagram");
                                continue;
                            }
                        };

                        if events.send(TransportEvent::Message(envelope)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "UDP receive error");
                    }
                }
            }
            _ = events.closed() => break,
        }
    }

    tracing::debug!("UDP receive loop stopped");
}
