//! Shared helpers for integration tests: a scripted transport and config.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chat_exchange::{
    Error, ExchangeConfig, ExchangeEvent, ExchangeRequest, FinalMessage, FrameStream,
    ProtocolFrame, Result, Transport, TransportResponse, decode_frames,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

pub fn test_config() -> ExchangeConfig {
    ExchangeConfig::builder()
        .base_url("http://localhost:5001/api")
        .build()
        .unwrap()
}

/// One scripted answer for one `send` call.
pub enum Script {
    /// Buffered reply
    Reply(FinalMessage),
    /// The call itself fails
    Fail(Error),
    /// Already-decoded frames
    Frames(Vec<Result<ProtocolFrame>>),
    /// Raw SSE chunks run through the real decoder
    Chunks(Vec<&'static str>),
    /// Frames pushed by the test through the paired sender
    Live(mpsc::UnboundedReceiver<Result<ProtocolFrame>>),
    /// Never answers; resolves only when the request is cancelled
    Hang,
}

/// Transport that answers each call with the next queued [`Script`] and
/// records every request it receives.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ExchangeRequest>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn requests(&self) -> Vec<ExchangeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ExchangeRequest) -> Result<TransportResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("no script queued for this call");

        match script {
            Script::Reply(message) => Ok(TransportResponse::Buffered(message)),
            Script::Fail(err) => Err(err),
            Script::Frames(frames) => {
                let stream: FrameStream = Box::pin(futures::stream::iter(frames));
                Ok(TransportResponse::Stream(stream))
            }
            Script::Chunks(parts) => {
                let chunks = futures::stream::iter(
                    parts
                        .into_iter()
                        .map(|part| Ok::<_, Error>(Bytes::from_static(part.as_bytes()))),
                );
                Ok(TransportResponse::Stream(decode_frames(Box::pin(chunks))))
            }
            Script::Live(rx) => Ok(TransportResponse::Stream(Box::pin(
                UnboundedReceiverStream::new(rx),
            ))),
            Script::Hang => {
                request.cancel_token().cancelled().await;
                Err(Error::Cancelled)
            }
        }
    }
}

/// Waits until the placeholder for `conversation_id` has been appended.
pub async fn wait_for_placeholder(
    events: &mut broadcast::Receiver<ExchangeEvent>,
    conversation_id: &str,
) {
    loop {
        match events.recv().await.unwrap() {
            ExchangeEvent::PlaceholderCreated {
                conversation_id: id,
                ..
            } if id == conversation_id => return,
            _ => continue,
        }
    }
}

/// Waits for the next reasoning delta of `conversation_id`.
pub async fn wait_for_delta(
    events: &mut broadcast::Receiver<ExchangeEvent>,
    conversation_id: &str,
) -> String {
    loop {
        match events.recv().await.unwrap() {
            ExchangeEvent::ReasoningDelta {
                conversation_id: id,
                delta,
                ..
            } if id == conversation_id => return delta,
            _ => continue,
        }
    }
}
