use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;

use rust_ice_core::message::{Message, MessageBuilder, MessageClass};
use rust_ice_core::transaction::TransactionId;

use super::PublicMapping;

/// Learns the public address a server observes for one local address.
#[async_trait]
pub trait PublicAddressProbe: Send + Sync {
    /// Sends a binding request from `local` to `server` and returns the
    /// observed mapping.
    async fn probe(&self, local: IpAddr, server: SocketAddr)
        -> crate::error::Result<PublicMapping>;
}

/// [`PublicAddressProbe`] speaking the binding method over a throwaway
/// UDP socket.
pub struct UdpProbe {
    timeout: Duration,
    retransmits: usize,
}

impl UdpProbe {
    pub fn new(timeout: Duration, retransmits: usize) -> Self {
        Self {
            timeout,
            retransmits,
        }
    }
}

#[async_trait]
impl PublicAddressProbe for UdpProbe {
    async fn probe(
        &self,
        local: IpAddr,
        server: SocketAddr,
    ) -> crate::error::Result<PublicMapping> {
        let socket = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
        socket.connect(server).await?;
        let face = socket.local_addr()?;

        let id = TransactionId::new();
        let request: Bytes = MessageBuilder::binding_request(&id).fingerprint().finish();

        let mut buf = [0u8; 512];
        for _ in 0..=self.retransmits {
            socket.send(&request).await?;
            let deadline = tokio::time::Instant::now() + self.timeout;
            // A stray datagram on the connected socket must not burn the
            // whole attempt, so keep reading until the deadline.
            loop {
                let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
                    Ok(len) => len?,
                    Err(_) => break,
                };
                let response = match Message::decode(&buf[..len]) {
                    Ok(response) => response,
                    Err(e) => {
                        log::debug!("discarding datagram from {server}: {e:?}");
                        continue;
                    }
                };
                if response.transaction_id() != &id
                    || response.class() != MessageClass::SuccessResponse
                {
                    continue;
                }
                let mask = match response.xor_mapped_address()? {
                    Some(addr) => addr,
                    None => match response.mapped_address()? {
                        Some(addr) => addr,
                        None => continue,
                    },
                };
                return Ok(PublicMapping { face, mask });
            }
        }
        Err(io::Error::from(io::ErrorKind::TimedOut).into())
    }
}
