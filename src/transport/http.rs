use crate::{
    error::MetricsError,
    events::{Message, encode_batch},
    settings::Config,
};
use reqwest::{Client, StatusCode, header::CONTENT_TYPE};
use std::{mem, time::Duration};
use tokio::{
    sync::mpsc::Receiver,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Buffers points and posts them as one JSON array on a fixed period.
///
/// The pending batch is cleared on every post whatever the outcome; a
/// rejected or failed batch is never resent.
#[derive(Debug)]
pub struct HttpTransport {
    client: Client,
    url: String,
    post_interval: Duration,
    raise_debug_verbosity: bool,
    pending: Vec<Message>,
}

impl HttpTransport {
    /// # Errors
    /// Fails when `config` carries no HTTP settings or the client cannot be
    /// built.
    pub fn new(config: &Config) -> Result<Self, MetricsError> {
        let http = config
            .http
            .as_ref()
            .ok_or_else(|| MetricsError::config("http settings are required"))?;
        let client = Client::builder()
            .timeout(http.timeout)
            .danger_accept_invalid_certs(http.insecure_skip_verify)
            .build()?;

        Ok(Self {
            client,
            url: config.ingest_url(),
            post_interval: http.post_interval,
            raise_debug_verbosity: config.raise_debug_verbosity,
            pending: Vec::new(),
        })
    }

    pub fn push(&mut self, message: Message) {
        self.pending.push(message);
    }

    pub fn pending(&self) -> &[Message] {
        &self.pending
    }

    /// Posts every pending point as one batch and clears the buffer.
    ///
    /// Does nothing when no point is pending.
    pub async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = mem::take(&mut self.pending);

        match self.post(&batch).await {
            Ok(StatusCode::NO_CONTENT) => {
                log::trace!("posted {} points to {}", batch.len(), self.url);
            }
            Ok(status) => {
                log::warn!(
                    "backend answered {status} to a batch of {} points, batch dropped",
                    batch.len()
                );
            }
            Err(e) => {
                log::error!("{e}, dropping {} points", batch.len());
            }
        }
    }

    async fn post(&self, batch: &[Message]) -> Result<StatusCode, MetricsError> {
        let payload = encode_batch(batch)?;
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT && self.raise_debug_verbosity {
            match response.text().await {
                Ok(body) => log::debug!("backend response: {body}"),
                Err(e) => log::error!("failed to read backend response: {e}"),
            }
        }
        Ok(status)
    }

    pub async fn run(mut self, mut receiver: Receiver<Message>, cancel: CancellationToken) {
        log::info!("starting http client loop for {}", self.url);
        let mut ticker = time::interval_at(Instant::now() + self.post_interval, self.post_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = self.flush() => {}
                    }
                }
                received = receiver.recv() => match received {
                    Some(message) => self.push(message),
                    None => break,
                },
            }
        }

        if !self.pending.is_empty() {
            log::info!("dropping {} pending points", self.pending.len());
        }
        log::info!("terminating the http client loop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::Tags, settings::Settings};
    use tokio::sync::mpsc;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path},
    };

    fn message(metric: &str, value: f64) -> Message {
        Message {
            metric: metric.into(),
            tags: Tags::from([("ksid".to_string(), "svc".to_string())]),
            value,
            timestamp: 1_700_000_000,
        }
    }

    fn transport(server: &MockServer, post_interval: &str) -> HttpTransport {
        let address = server.address();
        let config = Settings::new(address.ip().to_string(), address.port(), "http")
            .tag("ksid", "svc")
            .http_timeout("1s")
            .http_post_interval(post_interval)
            .raise_debug_verbosity(true)
            .validate()
            .unwrap();
        HttpTransport::new(&config).unwrap()
    }

    async fn mount(server: &MockServer, status: u16) {
        Mock::given(method("POST"))
            .and(path("/api/put"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(status).set_body_string("ingest says no"))
            .mount(server)
            .await;
    }

    async fn posted_batches(server: &MockServer) -> Vec<Vec<Message>> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|request| serde_json::from_slice(&request.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn posts_pending_points_as_one_batch() {
        let server = MockServer::start().await;
        mount(&server, 204).await;
        let mut transport = transport(&server, "10s");

        transport.push(message("request.count", 3.0));
        transport.push(message("request.duration", 12.5));
        transport.flush().await;

        assert!(transport.pending().is_empty());
        let batches = posted_batches(&server).await;
        assert_eq!(
            batches,
            vec![vec![
                message("request.count", 3.0),
                message("request.duration", 12.5)
            ]]
        );
    }

    #[tokio::test]
    async fn rejected_batches_are_dropped_not_resent() {
        let server = MockServer::start().await;
        mount(&server, 500).await;
        let mut transport = transport(&server, "10s");

        transport.push(message("request.count", 1.0));
        transport.push(message("request.count", 2.0));
        transport.flush().await;
        assert!(transport.pending().is_empty());
        assert_eq!(posted_batches(&server).await.len(), 1);

        transport.flush().await;
        assert!(transport.pending().is_empty());
        assert_eq!(posted_batches(&server).await.len(), 1);

        transport.push(message("request.count", 3.0));
        transport.flush().await;
        let batches = posted_batches(&server).await;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1], vec![message("request.count", 3.0)]);
    }

    #[tokio::test]
    async fn unreachable_backend_clears_the_batch() {
        let server = MockServer::start().await;
        let mut transport = transport(&server, "10s");
        drop(server);

        transport.push(message("request.count", 1.0));
        transport.flush().await;

        assert!(transport.pending().is_empty());
    }

    #[tokio::test]
    async fn loop_posts_on_the_timer() {
        let server = MockServer::start().await;
        mount(&server, 204).await;
        let transport = transport(&server, "100ms");
        let (sender, receiver) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(transport.run(receiver, cancel.clone()));

        for value in [1.0, 2.0, 3.0] {
            sender.send(message("request.count", value)).await.unwrap();
        }

        let mut batches = Vec::new();
        for _ in 0..40 {
            time::sleep(Duration::from_millis(50)).await;
            batches = posted_batches(&server).await;
            if !batches.is_empty() {
                break;
            }
        }
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);

        cancel.cancel();
        time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn nothing_is_posted_after_cancellation() {
        let server = MockServer::start().await;
        mount(&server, 204).await;
        let transport = transport(&server, "200ms");
        let (sender, receiver) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(transport.run(receiver, cancel.clone()));

        sender.send(message("request.count", 1.0)).await.unwrap();
        cancel.cancel();
        time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits after cancellation")
            .unwrap();

        time::sleep(Duration::from_millis(500)).await;
        assert!(posted_batches(&server).await.is_empty());
    }
}
