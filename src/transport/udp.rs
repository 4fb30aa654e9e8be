use crate::events::Message;
use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};
use tokio::{
    net::{self, UdpSocket},
    sync::mpsc::Receiver,
};
use tokio_util::sync::CancellationToken;

/// Sends each point as its own datagram as soon as it arrives.
#[derive(Debug)]
pub struct UdpTransport {
    address: String,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub const fn new(address: String) -> Self {
        Self {
            address,
            socket: None,
        }
    }

    async fn connect(&self) -> io::Result<UdpSocket> {
        let remote = net::lookup_host(&self.address)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address found for {}", self.address),
                )
            })?;
        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Ok(socket)
    }

    /// Opens the connection if there is none yet, logging failures.
    async fn ensure_connected(&mut self) -> Option<&UdpSocket> {
        if self.socket.is_none() {
            match self.connect().await {
                Ok(socket) => self.socket = Some(socket),
                Err(e) => {
                    log::error!("failed to connect to metrics backend {}: {e}", self.address);
                    return None;
                }
            }
        }
        self.socket.as_ref()
    }

    /// Writes one point. A failed write drops the point and the connection;
    /// the next point reconnects.
    pub async fn send(&mut self, message: &Message) {
        let payload: Vec<u8> = match message.try_into() {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("dropping point {}: {e}", message.metric);
                return;
            }
        };

        let Some(socket) = self.ensure_connected().await else {
            return;
        };
        if let Err(e) = socket.send(&payload).await {
            log::error!("failed to write point to {}: {e}", self.address);
            self.socket = None;
        }
    }

    pub async fn run(mut self, mut receiver: Receiver<Message>, cancel: CancellationToken) {
        log::info!("starting udp client loop for {}", self.address);
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                log::info!("terminating the udp client loop");
                return;
            }
            _ = self.ensure_connected() => {}
        }

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = receiver.recv() => {
                    let Some(message) = received else {
                        break;
                    };
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = self.send(&message) => {}
                    }
                }
            }
        }

        log::info!("terminating the udp client loop");
    }
}
