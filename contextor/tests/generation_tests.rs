use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use ai_llm_service::{AiLlmError, ChatMessage, ChatRole};
use async_trait::async_trait;
use contextor::{
    Answer, AskRequest, ChatModel, ContextorConfig, Contextor, ContextorError,
    ConversationContext, DEFAULT_FALLBACK, FallbackReason, FragmentStream, Generator,
    StreamState,
};
use futures::{StreamExt, stream};
use rag_store::{
    ContextBlock, Document, EmbedFuture, EmbeddingsProvider, HashEmbedder, IndexBackend,
    IngestMode, NoopProgress, RagConfig, RagError, RagStore, SearchFilter, keys,
};

const DIM: usize = 128;

/// Chat model that plays back fixed fragments, then ends as told.
#[derive(Default)]
struct ScriptedChat {
    fragments: Vec<&'static str>,
    then: Ending,
    transient_open_failures: AtomicUsize,
    /// Opens that never resolve.
    hanging_opens: AtomicUsize,
    opens: AtomicUsize,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
    /// Set once the fragment stream handed out last is dropped.
    released: Arc<AtomicBool>,
}

/// Sets its flag when dropped together with the stream that owns it.
struct ReleaseFlag(Arc<AtomicBool>);

impl Drop for ReleaseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Default, Clone, Copy)]
enum Ending {
    #[default]
    Done,
    Fail,
    Hang,
}

impl ScriptedChat {
    fn new(fragments: Vec<&'static str>, then: Ending) -> Arc<Self> {
        Arc::new(Self {
            fragments,
            then,
            ..Default::default()
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn last_messages(&self) -> Vec<ChatMessage> {
        self.seen.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<FragmentStream, ContextorError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self
            .hanging_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            std::future::pending::<()>().await;
        }
        if self
            .transient_open_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AiLlmError::Timeout(Duration::from_secs(1)).into());
        }
        self.seen.lock().unwrap().push(messages);

        let head = stream::iter(
            self.fragments
                .iter()
                .map(|f| Ok::<_, ContextorError>(f.to_string()))
                .collect::<Vec<_>>(),
        );
        let body: FragmentStream = match self.then {
            Ending::Done => head.boxed(),
            Ending::Fail => head
                .chain(stream::once(async {
                    Err(ContextorError::GenerationFailed("connection reset".into()))
                }))
                .boxed(),
            Ending::Hang => head.chain(stream::pending()).boxed(),
        };
        let flag = ReleaseFlag(self.released.clone());
        Ok(body
            .map(move |item| {
                let _held = &flag;
                item
            })
            .boxed())
    }
}

struct BrokenEmbeddings;

impl EmbeddingsProvider for BrokenEmbeddings {
    fn embed<'a>(&'a self, _text: &'a str) -> EmbedFuture<'a, Vec<f32>> {
        Box::pin(async {
            Err(RagError::EmbeddingUnavailable {
                attempts: 1,
                reason: "model not loaded".into(),
            })
        })
    }
}

fn rag_config() -> RagConfig {
    let mut cfg = RagConfig::new_default("http://localhost:6334", "movies-test", DIM);
    cfg.backend = IndexBackend::Memory;
    cfg.chunk_size = 200;
    cfg.chunk_overlap = 0;
    cfg
}

fn movie(id: &str, title: &str, overview: &str, adult: bool) -> Document {
    let mut d = Document::new(id, title, overview);
    d.is_adult = adult;
    d
}

async fn contextor_with(
    provider: Arc<dyn EmbeddingsProvider>,
    docs: &[Document],
    chat: Arc<ScriptedChat>,
) -> Contextor {
    let store = RagStore::open(rag_config(), provider).await.unwrap();
    if !docs.is_empty() {
        let report = store.ingest(docs, IngestMode::Upsert, &NoopProgress).await.unwrap();
        assert_eq!(report.failed, 0);
    }
    Contextor::new(Arc::new(store), chat, ContextorConfig::default())
}

async fn contextor(docs: &[Document], chat: Arc<ScriptedChat>) -> Contextor {
    contextor_with(Arc::new(HashEmbedder::new(DIM)), docs, chat).await
}

fn conversation(question: &str) -> ConversationContext {
    ConversationContext::new("Answer briefly.", &ContextBlock::default(), vec![ChatMessage::user(question)])
}

fn expect_stream(answer: Answer) -> contextor::GenerationStream {
    match answer {
        Answer::Streaming { stream, .. } => stream,
        other => panic!("expected a stream, got {other:?}"),
    }
}

#[tokio::test]
async fn grounded_answer_streams_in_order() {
    let chat = ScriptedChat::new(vec!["Heat ", "is ", "a heist movie."], Ending::Done);
    let ctx = contextor(
        &[
            movie("1", "Heat", "A crew of thieves plans one last bank heist in Los Angeles", false),
            movie("2", "Paddington", "A bear from Peru looks for a home in London", false),
        ],
        chat.clone(),
    )
    .await;

    let answer = ctx
        .ask(AskRequest::new("Which movie is about a bank heist?").with_top_k(1))
        .await
        .unwrap();
    let Answer::Streaming { mut stream, sources } = answer else {
        panic!("expected a stream");
    };
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].title.as_deref(), Some("Heat"));

    assert_eq!(chat.opens(), 0, "nothing is sent before the first pull");
    assert_eq!(stream.state(), StreamState::Idle);

    let text = stream.collect_text().await.unwrap();
    assert_eq!(text, "Heat is a heist movie.");
    assert_eq!(stream.state(), StreamState::Completed);
    assert_eq!(stream.delivered(), 3);
    assert!(stream.next_fragment().await.is_none());

    let sent = chat.last_messages();
    assert_eq!(sent[0].role, ChatRole::System);
    assert!(sent[0].content.contains("==[1]== Heat"));
    assert!(!sent[0].content.contains("Paddington"));
    assert_eq!(sent.last(), Some(&ChatMessage::user("Which movie is about a bank heist?")));
}

#[tokio::test]
async fn history_precedes_the_question() {
    let chat = ScriptedChat::new(vec!["ok"], Ending::Done);
    let ctx = contextor(&[movie("1", "Heat", "A bank heist in Los Angeles", false)], chat.clone()).await;

    let history = vec![
        ChatMessage::user("I like crime movies."),
        ChatMessage::assistant("Noted."),
    ];
    let mut stream = expect_stream(
        ctx.ask(AskRequest::new("Recommend a heist movie").with_history(history))
            .await
            .unwrap(),
    );
    stream.collect_text().await.unwrap();

    let roles: Vec<ChatRole> = chat.last_messages().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::User]
    );
}

#[tokio::test]
async fn cancel_mid_stream_stops_delivery() {
    let chat = ScriptedChat::new(vec!["one ", "two "], Ending::Hang);
    let mut stream = Generator::new(chat.clone()).generate(conversation("q")).unwrap();
    let handle = stream.cancel_handle();

    assert_eq!(stream.next_fragment().await.unwrap().unwrap(), "one ");
    assert_eq!(stream.state(), StreamState::Streaming);

    handle.cancel();
    assert!(stream.next_fragment().await.is_none());
    assert_eq!(stream.state(), StreamState::Cancelled);
    assert!(stream.next_fragment().await.is_none());
    assert_eq!(stream.delivered(), 1);
}

#[tokio::test]
async fn cancel_releases_the_upstream_stream() {
    let chat = ScriptedChat::new(vec!["one ", "two "], Ending::Hang);
    let mut stream = Generator::new(chat.clone()).generate(conversation("q")).unwrap();

    assert_eq!(stream.next_fragment().await.unwrap().unwrap(), "one ");
    assert!(!chat.released());

    stream.cancel();
    assert!(stream.next_fragment().await.is_none());
    assert_eq!(stream.state(), StreamState::Cancelled);

    tokio::time::timeout(Duration::from_secs(1), async {
        while !chat.released() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("upstream stream dropped after cancel");
}

#[tokio::test]
async fn cancel_before_first_pull_never_calls_the_model() {
    let chat = ScriptedChat::new(vec!["never"], Ending::Done);
    let mut stream = Generator::new(chat.clone()).generate(conversation("q")).unwrap();

    stream.cancel();
    assert!(stream.next_fragment().await.is_none());
    assert_eq!(stream.state(), StreamState::Cancelled);
    assert_eq!(chat.opens(), 0);
}

#[tokio::test]
async fn mid_stream_failure_is_reported_once() {
    let chat = ScriptedChat::new(vec!["partial ", "answer"], Ending::Fail);
    let mut stream = Generator::new(chat).generate(conversation("q")).unwrap();

    assert_eq!(stream.next_fragment().await.unwrap().unwrap(), "partial ");
    assert_eq!(stream.next_fragment().await.unwrap().unwrap(), "answer");
    let err = stream.next_fragment().await.unwrap().unwrap_err();
    assert!(matches!(err, ContextorError::GenerationFailed(_)), "{err:?}");
    assert_eq!(stream.state(), StreamState::Failed);
    assert!(stream.next_fragment().await.is_none());
}

#[tokio::test]
async fn empty_conversation_is_rejected_without_a_model_call() {
    let chat = ScriptedChat::new(vec!["x"], Ending::Done);
    let convo = ConversationContext::new("s", &ContextBlock::default(), vec![]);
    let err = Generator::new(chat.clone()).generate(convo).err().unwrap();
    assert!(matches!(err, ContextorError::InvalidConversation(_)));
    assert_eq!(chat.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_model_times_out() {
    let chat = ScriptedChat::new(vec!["first"], Ending::Hang);
    let mut stream = Generator::new(chat)
        .with_timeout(Duration::from_secs(2))
        .generate(conversation("q"))
        .unwrap();

    assert_eq!(stream.next_fragment().await.unwrap().unwrap(), "first");
    let err = stream.next_fragment().await.unwrap().unwrap_err();
    assert!(matches!(err, ContextorError::Timeout(d) if d == Duration::from_secs(2)));
    assert_eq!(stream.state(), StreamState::Failed);
}

#[tokio::test(start_paused = true)]
async fn transient_open_failure_is_retried() {
    let chat = Arc::new(ScriptedChat {
        fragments: vec!["hello"],
        transient_open_failures: AtomicUsize::new(1),
        ..Default::default()
    });
    let mut stream = Generator::new(chat.clone())
        .with_max_attempts(2)
        .generate(conversation("q"))
        .unwrap();

    assert_eq!(stream.collect_text().await.unwrap(), "hello");
    assert_eq!(chat.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn hung_open_is_abandoned_and_retried_within_the_generation_timeout() {
    let chat = Arc::new(ScriptedChat {
        fragments: vec!["late but fine"],
        hanging_opens: AtomicUsize::new(1),
        ..Default::default()
    });
    let mut stream = Generator::new(chat.clone())
        .with_timeout(Duration::from_secs(30))
        .with_open_timeout(Duration::from_secs(5))
        .with_max_attempts(2)
        .generate(conversation("q"))
        .unwrap();

    assert_eq!(stream.collect_text().await.unwrap(), "late but fine");
    assert_eq!(chat.opens(), 2);
    assert_eq!(stream.state(), StreamState::Completed);
}

#[tokio::test(start_paused = true)]
async fn open_failure_past_the_attempt_budget_fails_the_stream() {
    let chat = Arc::new(ScriptedChat {
        fragments: vec!["hello"],
        transient_open_failures: AtomicUsize::new(5),
        ..Default::default()
    });
    let mut stream = Generator::new(chat.clone())
        .with_max_attempts(2)
        .generate(conversation("q"))
        .unwrap();

    assert!(stream.next_fragment().await.unwrap().is_err());
    assert_eq!(stream.state(), StreamState::Failed);
    assert_eq!(chat.opens(), 2);
}

#[tokio::test]
async fn empty_store_gives_the_fallback_answer() {
    let chat = ScriptedChat::new(vec!["x"], Ending::Done);
    let ctx = contextor(&[], chat.clone()).await;

    match ctx.ask(AskRequest::new("Any space westerns?")).await.unwrap() {
        Answer::Fallback { message, reason } => {
            assert_eq!(message, DEFAULT_FALLBACK);
            assert_eq!(reason, FallbackReason::NoContext);
        }
        other => panic!("expected fallback, got {other:?}"),
    }
    assert_eq!(chat.opens(), 0);
}

#[tokio::test]
async fn adult_titles_are_excluded_unless_asked_for() {
    let chat = ScriptedChat::new(vec!["x"], Ending::Done);
    let ctx = contextor(
        &[movie("9", "Night Shift", "A gritty crime story in the city at night", true)],
        chat.clone(),
    )
    .await;

    let guarded = ctx.ask(AskRequest::new("gritty crime story")).await.unwrap();
    assert!(guarded.is_fallback());

    let explicit = SearchFilter::new().matches(keys::IS_ADULT, true);
    let answer = ctx
        .ask(AskRequest::new("gritty crime story").with_filter(explicit))
        .await
        .unwrap();
    let Answer::Streaming { sources, .. } = answer else {
        panic!("expected a stream");
    };
    assert_eq!(sources[0].document_id.as_deref(), Some("9"));
}

#[tokio::test]
async fn retrieval_failure_becomes_the_fallback() {
    let chat = ScriptedChat::new(vec!["x"], Ending::Done);
    let ctx = contextor_with(Arc::new(BrokenEmbeddings), &[], chat.clone()).await;

    match ctx.ask(AskRequest::new("anything")).await.unwrap() {
        Answer::Fallback { message, reason } => {
            assert_eq!(message, ctx.fallback_answer());
            assert_eq!(reason, FallbackReason::RetrievalFailed);
        }
        other => panic!("expected fallback, got {other:?}"),
    }
}

#[tokio::test]
async fn blank_question_and_zero_k_are_caller_errors() {
    let chat = ScriptedChat::new(vec!["x"], Ending::Done);
    let ctx = contextor(&[], chat).await;

    assert!(matches!(
        ctx.ask(AskRequest::new("   ")).await,
        Err(ContextorError::InvalidArgument(_))
    ));
    assert!(matches!(
        ctx.ask(AskRequest::new("heist").with_top_k(0)).await,
        Err(ContextorError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn into_stream_yields_every_fragment() {
    let chat = ScriptedChat::new(vec!["a", "b", "c"], Ending::Done);
    let stream = Generator::new(chat).generate(conversation("q")).unwrap();
    let parts: Vec<String> = stream
        .into_stream()
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(parts, vec!["a", "b", "c"]);
}
