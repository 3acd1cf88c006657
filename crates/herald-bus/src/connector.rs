//! Channel connectors for the event client.
//!
//! A connector opens one push channel and hands back its raw byte stream.
//! Framing, decoding and reconnects stay in the
//! [`EventClient`](crate::client::EventClient); connectors only know how to
//! reach the server.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header;
use tracing::{debug, instrument};
use url::Url;

use crate::config::ClientSettings;
use crate::error::{BusError, BusResult};

/// Raw bytes of an open push channel. The stream ending means the channel
/// closed.
pub type ChannelStream = Pin<Box<dyn Stream<Item = BusResult<Bytes>> + Send>>;

/// Opens push channels.
#[async_trait]
pub trait ChannelConnector: Send + Sync + 'static {
    async fn open(&self) -> BusResult<ChannelStream>;
}

// =============================================================================
// Credentials
// =============================================================================

/// How the console proves its admin session.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Sent as `Authorization: Bearer <token>`.
    pub bearer_token: Option<String>,
    /// Sent as `Cookie: <name>=<value>`.
    pub session_cookie: Option<(String, String)>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Credentials {
            bearer_token: Some(token.into()),
            session_cookie: None,
        }
    }

    pub fn cookie(name: impl Into<String>, value: impl Into<String>) -> Self {
        Credentials {
            bearer_token: None,
            session_cookie: Some((name.into(), value.into())),
        }
    }
}

// =============================================================================
// HTTP Connector
// =============================================================================

/// Opens the channel with `GET <events_url>` over reqwest.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    url: Url,
    credentials: Credentials,
    connect_timeout: Duration,
}

impl HttpConnector {
    pub fn new(url: &str, credentials: Credentials, connect_timeout: Duration) -> BusResult<Self> {
        let url = Url::parse(url)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(BusError::InvalidUrl(format!(
                "Events URL must start with http:// or https://, got: {}",
                url
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| BusError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(HttpConnector {
            client,
            url,
            credentials,
            connect_timeout,
        })
    }

    pub fn from_settings(settings: &ClientSettings, credentials: Credentials) -> BusResult<Self> {
        Self::new(&settings.events_url, credentials, settings.connect_timeout())
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn request(&self) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache");

        if let Some(token) = &self.credentials.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some((name, value)) = &self.credentials.session_cookie {
            request = request.header(header::COOKIE, format!("{}={}", name, value));
        }
        request
    }
}

#[async_trait]
impl ChannelConnector for HttpConnector {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn open(&self) -> BusResult<ChannelStream> {
        let response = tokio::time::timeout(self.connect_timeout, self.request().send())
            .await
            .map_err(|_| BusError::Timeout(self.connect_timeout.as_secs()))??;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "Events endpoint refused channel");
            return Err(BusError::HttpStatus(status.as_u16()));
        }

        debug!("Push channel opened");
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| BusError::Disconnected(e.to_string())));
        Ok(Box::pin(stream))
    }
}
