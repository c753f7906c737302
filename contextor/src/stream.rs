//! Cancellable streamed generation.
//!
//! A [`GenerationStream`] is lazy: nothing is sent to the model until the
//! first [`GenerationStream::next_fragment`] call. From then on a pump task
//! forwards upstream fragments through a one-slot channel, so the model is
//! never read further ahead than the consumer. Cancellation is observed by
//! both the pump (which drops the upstream connection) and the consumer
//! (which stops yielding immediately).

use std::sync::Arc;
use std::time::Duration;

use ai_llm_service::{AiLlmError, ChatMessage};
use futures::{Stream, StreamExt, stream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cfg::ContextorConfig;
use crate::error::ContextorError;
use crate::llm::{ChatModel, FragmentStream};
use crate::prompt::ConversationContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Failed | StreamState::Cancelled
        )
    }
}

/// Cloneable handle that stops a [`GenerationStream`] from any task.
#[derive(Clone, Debug)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

type Item = Result<String, ContextorError>;

/// Opens generation streams against one chat model.
#[derive(Clone)]
pub struct Generator {
    model: Arc<dyn ChatModel>,
    timeout: Duration,
    open_timeout: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl Generator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self::from_config(model, &ContextorConfig::default())
    }

    pub fn from_config(model: Arc<dyn ChatModel>, cfg: &ContextorConfig) -> Self {
        Self {
            model,
            timeout: cfg.generation_timeout,
            open_timeout: cfg.llm_open_timeout,
            max_attempts: cfg.llm_max_attempts.max(1),
            backoff: cfg.llm_retry_backoff,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bound for one attempt at opening the model stream.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Prepares a stream for `conversation` in [`StreamState::Idle`].
    ///
    /// # Errors
    /// [`ContextorError::InvalidConversation`] right away; no model call is made.
    pub fn generate(&self, conversation: ConversationContext) -> Result<GenerationStream, ContextorError> {
        conversation.validate()?;
        Ok(GenerationStream {
            state: StreamState::Idle,
            pending: Some(Pending {
                model: self.model.clone(),
                messages: conversation.to_messages(),
                open_timeout: self.open_timeout,
                max_attempts: self.max_attempts,
                backoff: self.backoff,
            }),
            rx: None,
            pump: None,
            cancel: CancellationToken::new(),
            timeout: self.timeout,
            delivered: 0,
        })
    }
}

struct Pending {
    model: Arc<dyn ChatModel>,
    messages: Vec<ChatMessage>,
    open_timeout: Duration,
    max_attempts: u32,
    backoff: Duration,
}

/// One answer, pulled fragment by fragment.
pub struct GenerationStream {
    state: StreamState,
    pending: Option<Pending>,
    rx: Option<mpsc::Receiver<Item>>,
    pump: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    timeout: Duration,
    delivered: usize,
}

enum Step {
    Cancelled,
    TimedOut,
    Received(Option<Item>),
}

impl GenerationStream {
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Fragments yielded so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next fragment in upstream order.
    ///
    /// `None` once the stream is terminal. A failure is reported once as
    /// `Some(Err(..))` and the stream ends in [`StreamState::Failed`];
    /// after a cancel no further fragment is yielded.
    pub async fn next_fragment(&mut self) -> Option<Item> {
        match self.state {
            StreamState::Idle => {
                if self.cancel.is_cancelled() {
                    debug!("generation cancelled before start");
                    self.pending = None;
                    self.state = StreamState::Cancelled;
                    return None;
                }
                self.start();
            }
            StreamState::Streaming => {}
            _ => return None,
        }

        let step = {
            let cancel = &self.cancel;
            let rx = self.rx.as_mut()?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                r = tokio::time::timeout(self.timeout, rx.recv()) => match r {
                    Ok(item) => Step::Received(item),
                    Err(_) => Step::TimedOut,
                },
            }
        };

        match step {
            Step::Cancelled => {
                info!(delivered = self.delivered, "generation cancelled");
                self.finish(StreamState::Cancelled);
                None
            }
            Step::TimedOut => {
                warn!(delivered = self.delivered, timeout = ?self.timeout, "generation timed out");
                self.finish(StreamState::Failed);
                Some(Err(ContextorError::Timeout(self.timeout)))
            }
            Step::Received(Some(Ok(fragment))) => {
                self.delivered += 1;
                Some(Ok(fragment))
            }
            Step::Received(Some(Err(e))) => {
                warn!(delivered = self.delivered, error = %e, "generation failed");
                self.finish(StreamState::Failed);
                Some(Err(match e {
                    ContextorError::Timeout(d) => ContextorError::Timeout(d),
                    other => ContextorError::GenerationFailed(other.to_string()),
                }))
            }
            Step::Received(None) => {
                // The pump only closes the channel silently on success or cancel.
                let terminal = if self.cancel.is_cancelled() {
                    StreamState::Cancelled
                } else {
                    StreamState::Completed
                };
                debug!(delivered = self.delivered, state = ?terminal, "generation ended");
                self.finish(terminal);
                None
            }
        }
    }

    /// Drains the rest of the answer into one string.
    pub async fn collect_text(&mut self) -> Result<String, ContextorError> {
        let mut out = String::new();
        while let Some(item) = self.next_fragment().await {
            out.push_str(&item?);
        }
        Ok(out)
    }

    /// Adapts the stream to [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Item> + Send {
        stream::unfold(self, |mut s| async move { s.next_fragment().await.map(|item| (item, s)) })
    }

    fn start(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let (tx, rx) = mpsc::channel(1);
        self.rx = Some(rx);
        self.pump = Some(tokio::spawn(pump(pending, tx, self.cancel.clone())));
        self.state = StreamState::Streaming;
        debug!("generation started");
    }

    fn finish(&mut self, state: StreamState) {
        self.state = state;
        // Stops the pump, which drops the upstream connection.
        self.cancel.cancel();
        self.rx = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump(pending: Pending, tx: mpsc::Sender<Item>, cancel: CancellationToken) {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        r = open_with_retry(&pending) => r,
    };
    let mut upstream = match opened {
        Ok(s) => s,
        Err(e) => {
            forward(&tx, &cancel, Err(e)).await;
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            n = upstream.next() => n,
        };
        match next {
            Some(Ok(fragment)) => {
                if !forward(&tx, &cancel, Ok(fragment)).await {
                    return;
                }
            }
            Some(Err(e)) => {
                forward(&tx, &cancel, Err(e)).await;
                return;
            }
            None => return,
        }
    }
}

/// Sends one item unless the consumer is gone or the stream was cancelled.
async fn forward(tx: &mpsc::Sender<Item>, cancel: &CancellationToken, item: Item) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        r = tx.send(item) => r.is_ok(),
    }
}

async fn open_with_retry(p: &Pending) -> Result<FragmentStream, ContextorError> {
    let mut attempt = 1;
    loop {
        let opened = tokio::time::timeout(p.open_timeout, p.model.stream_chat(p.messages.clone()))
            .await
            .unwrap_or_else(|_| Err(AiLlmError::Timeout(p.open_timeout).into()));
        match opened {
            Ok(s) => return Ok(s),
            Err(e) if e.is_transient() && attempt < p.max_attempts => {
                warn!(attempt, max = p.max_attempts, error = %e, "chat open failed, retrying");
                tokio::time::sleep(p.backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
