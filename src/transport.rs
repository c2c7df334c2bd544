//! Transport adapter: issues the chat call and hands back protocol frames
//!
//! The manager only ever talks to a [`Transport`]. A transport receives a
//! fully built [`ExchangeRequest`] and answers in one of two shapes:
//!
//! - **Buffered**: the backend returned one JSON body with the whole reply
//!   (`wants_reasoning_trace == false`).
//! - **Streamed**: the backend returned a `text/event-stream` body that is
//!   decoded into [`ProtocolFrame`]s as it arrives
//!   (`wants_reasoning_trace == true`).
//!
//! Both shapes collapse into a [`FrameStream`] via
//! [`TransportResponse::into_frames`], so the driver has a single loop.
//!
//! ## Cancellation
//!
//! The request carries the exchange's cancellation token. [`HttpTransport`]
//! races the open call and the buffered body read against it, and cuts the
//! streamed body off once it fires, so no further frames are produced.

use crate::config::ExchangeConfig;
use crate::decoder::{decode_frames, single_final};
use crate::retry::{RetryConfig, retry_with_backoff_conditional};
use crate::types::{ChatPayload, ExchangeRequest, FinalMessage, ReplyEnvelope};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::Arc;
use std::time::Duration;

pub use crate::decoder::{ChunkStream, FrameStream};

/// Response of a transport call before it is driven to completion.
pub enum TransportResponse {
    /// Whole reply in one body
    Buffered(FinalMessage),
    /// Frames decoded incrementally from an event stream
    Stream(FrameStream),
}

impl TransportResponse {
    pub fn is_streaming(&self) -> bool {
        matches!(self, TransportResponse::Stream(_))
    }

    /// Uniform frame view: a buffered reply becomes a single `final` frame.
    pub fn into_frames(self) -> FrameStream {
        match self {
            TransportResponse::Buffered(message) => single_final(message),
            TransportResponse::Stream(frames) => frames,
        }
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportResponse::Buffered(message) => {
                f.debug_tuple("Buffered").field(message).finish()
            }
            TransportResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Issues one chat call for an exchange.
///
/// Implementations must observe `request.cancel_token()`: once it fires they
/// should stop producing frames and may return [`Error::Cancelled`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ExchangeRequest) -> Result<TransportResponse>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: &ExchangeRequest) -> Result<TransportResponse> {
        (**self).send(request).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&self, request: &ExchangeRequest) -> Result<TransportResponse> {
        (**self).send(request).await
    }
}

/// HTTP implementation of [`Transport`] over the backend's chat endpoint.
///
/// The underlying `reqwest::Client` is built once and reused across
/// exchanges for connection pooling.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    endpoint_url: String,
    auth_token: Option<String>,
    system_prompt: Option<String>,
    retry: Option<RetryConfig>,
}

impl HttpTransport {
    /// Builds the transport from the manager configuration.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        // The timeout covers the whole request, streamed body included
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint_url: config.endpoint_url(),
            auth_token: config.auth_token.clone(),
            system_prompt: config.system_prompt.clone(),
            retry: config.retry.clone(),
        })
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// Sends the payload once and checks the status line.
    async fn open(&self, payload: &ChatPayload, streaming: bool) -> Result<reqwest::Response> {
        let accept = if streaming {
            "text/event-stream"
        } else {
            "application/json"
        };

        let mut builder = self
            .http_client
            .post(&self.endpoint_url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept)
            .json(payload);

        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;

        // Non-success statuses carry the backend's explanation in the body
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_else(|e| {
                log::warn!("Failed to read error response body: {}", e);
                String::new()
            });
            return Err(Error::status(status, body));
        }

        Ok(response)
    }

    async fn open_with_retry(
        &self,
        payload: &ChatPayload,
        streaming: bool,
    ) -> Result<reqwest::Response> {
        match &self.retry {
            Some(retry) => {
                retry_with_backoff_conditional(retry.clone(), || self.open(payload, streaming))
                    .await
            }
            None => self.open(payload, streaming).await,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ExchangeRequest) -> Result<TransportResponse> {
        let token = request.cancel_token().clone();
        let streaming = request.wants_reasoning_trace();
        let payload = ChatPayload::from_request(request, self.system_prompt.as_deref());

        log::debug!(
            "POST {} (conversation {}, streaming: {}, history turns: {})",
            self.endpoint_url,
            request.conversation_id(),
            streaming,
            request.history().len()
        );

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            response = self.open_with_retry(&payload, streaming) => response?,
        };

        if streaming {
            // Cut the body off as soon as the exchange is cancelled
            let chunks = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(Error::from))
                .take_until(token.cancelled_owned());
            return Ok(TransportResponse::Stream(decode_frames(Box::pin(chunks))));
        }

        let body = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            body = response.text() => body?,
        };
        Ok(TransportResponse::Buffered(ReplyEnvelope::parse(&body)?))
    }
}
