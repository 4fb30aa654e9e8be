//! Strategies shipping finalized points to the backend.
//!
//! Both strategies own the receiving end of the message channel and run as a
//! single task, so their connection or pending batch never needs a lock.
//! Delivery is at-most-once: failures are logged and the affected points
//! are dropped.

mod http;
mod udp;

pub use http::HttpTransport;
pub use udp::UdpTransport;

use crate::{
    error::MetricsError,
    events::Message,
    settings::{Config, Protocol},
};
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum Transport {
    Udp(UdpTransport),
    Http(HttpTransport),
}

impl Transport {
    /// Builds the strategy selected by `config.protocol`.
    ///
    /// # Errors
    /// Fails when the HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self, MetricsError> {
        match config.protocol {
            Protocol::Udp => Ok(Self::Udp(UdpTransport::new(config.socket_address()))),
            Protocol::Http => HttpTransport::new(config).map(Self::Http),
        }
    }

    /// Consumes `receiver` until `cancel` fires or every sender is gone.
    pub async fn run(self, receiver: Receiver<Message>, cancel: CancellationToken) {
        match self {
            Self::Udp(transport) => transport.run(receiver, cancel).await,
            Self::Http(transport) => transport.run(receiver, cancel).await,
        }
    }
}
