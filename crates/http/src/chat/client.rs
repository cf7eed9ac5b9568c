use crate::chat::{config::TransportConfig, options::RequestOptions, transport::ReqwestTransport};
use bytes::Bytes;
use futures::StreamExt;
use std::{future::Future, time::Duration};
use stream_core::{
    llm::{ByteStream, ChatError, ChatMessage, HttpRequest, OutgoingMessage, Transport},
    CancellationToken, ChunkDecoder, IdGenerator, NanoId, Utf8Decoder,
};
use tracing::{debug, info, warn};

/// Drives one POST, stream, accumulate, finish cycle per call.
///
/// Calls are independent: each owns its decoder and accumulator. Only
/// [`post_cancellable`](Self::post_cancellable) looks at a cancellation token.
pub struct StreamingClient<T, I = NanoId, D = Utf8Decoder> {
    transport: T,
    ids: I,
    decoder: D,
    idle_timeout: Option<Duration>,
}

impl<T: Transport> StreamingClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            ids: NanoId::default(),
            decoder: Utf8Decoder::new(),
            idle_timeout: None,
        }
    }
}

impl StreamingClient<ReqwestTransport> {
    pub fn from_config(cfg: &TransportConfig) -> anyhow::Result<Self> {
        Ok(Self::new(ReqwestTransport::new(cfg)?).with_idle_timeout(cfg.stream_idle_timeout))
    }
}

impl<T, I, D> StreamingClient<T, I, D>
where
    T: Transport,
    I: IdGenerator,
    D: ChunkDecoder + Clone,
{
    pub fn with_id_generator<J: IdGenerator>(self, ids: J) -> StreamingClient<T, J, D> {
        StreamingClient {
            transport: self.transport,
            ids,
            decoder: self.decoder,
            idle_timeout: self.idle_timeout,
        }
    }

    /// `decoder` is cloned fresh for every request.
    pub fn with_decoder<E: ChunkDecoder + Clone>(self, decoder: E) -> StreamingClient<T, I, E> {
        StreamingClient {
            transport: self.transport,
            ids: self.ids,
            decoder,
            idle_timeout: self.idle_timeout,
        }
    }

    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends `messages` to `endpoint` and reports the outcome through exactly
    /// one of `on_finish` / `on_error`. Never returns an error itself.
    pub async fn post(&self, endpoint: &str, messages: &[OutgoingMessage], options: RequestOptions) {
        self.drive(endpoint, messages, options, None).await;
    }

    /// Like [`post`](Self::post), but gives up as soon as `token` is
    /// cancelled. A cancelled call drops what it accumulated and fires neither
    /// callback.
    pub async fn post_cancellable(
        &self,
        endpoint: &str,
        messages: &[OutgoingMessage],
        options: RequestOptions,
        token: &CancellationToken,
    ) {
        self.drive(endpoint, messages, options, Some(token)).await;
    }

    /// Callback-free form of [`post`](Self::post). Callbacks on `options` are
    /// ignored. The request is built before the returned future first runs,
    /// so the future borrows only `self`.
    pub fn complete<'a>(
        &'a self,
        endpoint: &str,
        messages: &[OutgoingMessage],
        options: &RequestOptions,
    ) -> impl Future<Output = Result<ChatMessage, ChatError>> + 'a {
        let request = Self::build_request(endpoint, messages, options);
        async move { self.run(request?, None).await }
    }

    // The request is built and the callbacks split off before the first
    // await, so the future never borrows `RequestOptions` (which is !Sync).
    async fn drive(
        &self,
        endpoint: &str,
        messages: &[OutgoingMessage],
        options: RequestOptions,
        token: Option<&CancellationToken>,
    ) {
        let request = Self::build_request(endpoint, messages, &options);
        let (on_finish, on_error) = options.into_callbacks();
        let result = match request {
            Ok(request) => self.run(request, token).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(msg) => {
                info!(target: "chatstream::client", "finished endpoint={} id={} len={}", endpoint, msg.id, msg.content.len());
                if let Some(f) = on_finish {
                    f(msg);
                }
            }
            Err(ChatError::Canceled) => {
                debug!(target: "chatstream::client", "superseded endpoint={}, result dropped", endpoint);
            }
            Err(e) => {
                warn!(target: "chatstream::client", "failed endpoint={}: {}", endpoint, e);
                if let Some(f) = on_error {
                    f(e);
                }
            }
        }
    }

    fn build_request(
        endpoint: &str,
        messages: &[OutgoingMessage],
        options: &RequestOptions,
    ) -> Result<HttpRequest, ChatError> {
        url::Url::parse(endpoint)
            .map_err(|e| ChatError::InvalidRequest(format!("endpoint {endpoint:?}: {e}")))?;
        let body = serde_json::to_vec(&options.payload(messages))
            .map_err(|e| ChatError::InvalidRequest(e.to_string()))?;
        info!(target: "chatstream::client", "post endpoint={} messages={}", endpoint, messages.len());
        Ok(HttpRequest {
            url: endpoint.to_string(),
            method: "POST",
            headers: options.merged_headers(),
            body,
        })
    }

    async fn run(
        &self,
        request: HttpRequest,
        token: Option<&CancellationToken>,
    ) -> Result<ChatMessage, ChatError> {
        let endpoint = request.url.clone();
        let resp = until_cancelled(token, self.transport.send(request)).await??;
        if resp.status != 200 {
            warn!(target: "chatstream::client", "non-200 status={} endpoint={}", resp.status, endpoint);
            return Err(ChatError::Status(resp.status));
        }
        let Some(mut body) = resp.body else {
            warn!(target: "chatstream::client", "no body endpoint={}", endpoint);
            return Err(ChatError::NoBody);
        };

        let mut decoder = self.decoder.clone();
        let mut content = String::new();
        while let Some(chunk) = until_cancelled(token, self.next_chunk(&mut body)).await?? {
            let text = decoder.decode(&chunk)?;
            debug!(target: "chatstream::client", "chunk bytes={} total={}", chunk.len(), content.len() + text.len());
            content.push_str(&text);
        }
        content.push_str(&decoder.finish()?);

        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(ChatError::Canceled);
        }
        Ok(ChatMessage::assistant(self.ids.generate(), content))
    }

    async fn next_chunk(&self, body: &mut ByteStream) -> Result<Option<Bytes>, ChatError> {
        let next = match self.idle_timeout {
            Some(idle) => tokio::time::timeout(idle, body.next())
                .await
                .map_err(|_| ChatError::Timeout(format!("no data for {}ms", idle.as_millis())))?,
            None => body.next().await,
        };
        next.transpose()
    }
}

async fn until_cancelled<F: Future>(
    token: Option<&CancellationToken>,
    fut: F,
) -> Result<F::Output, ChatError> {
    match token {
        Some(t) => tokio::select! {
            biased;
            _ = t.cancelled() => Err(ChatError::Canceled),
            out = fut => Ok(out),
        },
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{
        channel::{mpsc, oneshot},
        stream,
    };
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };
    use stream_core::{
        llm::{Role, TransportResponse},
        CancellationCoordinator,
    };

    enum Reply {
        Fail(ChatError),
        Status(u16, Option<ByteStream>),
    }

    struct ScriptedTransport {
        reply: Mutex<Option<Reply>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        fn new(reply: Reply) -> Self {
            Self {
                reply: Mutex::new(Some(reply)),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn ok(chunks: &[&'static str]) -> Self {
            Self::new(Reply::Status(200, Some(chunk_stream(chunks))))
        }

        fn requests(&self) -> Vec<HttpRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedTransport {
        async fn send(&self, request: HttpRequest) -> Result<TransportResponse, ChatError> {
            self.seen.lock().unwrap().push(request);
            match self.reply.lock().unwrap().take().expect("one request per script") {
                Reply::Fail(e) => Err(e),
                Reply::Status(status, body) => Ok(TransportResponse::new(status, body)),
            }
        }
    }

    fn chunk_stream(chunks: &[&'static str]) -> ByteStream {
        let items: Vec<_> = chunks.iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))).collect();
        Box::pin(stream::iter(items))
    }

    #[derive(Clone, Default)]
    struct Outcomes {
        finished: Arc<Mutex<Vec<ChatMessage>>>,
        errors: Arc<Mutex<Vec<ChatError>>>,
    }

    impl Outcomes {
        fn options(&self) -> RequestOptions {
            let f = self.finished.clone();
            let e = self.errors.clone();
            RequestOptions::new()
                .on_finish(move |m| f.lock().unwrap().push(m))
                .on_error(move |err| e.lock().unwrap().push(err))
        }
        fn finished(&self) -> Vec<ChatMessage> {
            self.finished.lock().unwrap().clone()
        }
        fn errors(&self) -> Vec<ChatError> {
            self.errors.lock().unwrap().clone()
        }
    }

    const ENDPOINT: &str = "http://mock-api.com/endpoint";

    fn client(t: ScriptedTransport) -> StreamingClient<ScriptedTransport, impl IdGenerator> {
        StreamingClient::new(t).with_id_generator(|| "random-id".to_string())
    }

    fn msgs() -> Vec<OutgoingMessage> {
        vec![OutgoingMessage::system("test content")]
    }

    #[tokio::test]
    async fn accumulates_chunks_in_order() {
        let c = client(ScriptedTransport::ok(&["Hello", " ", "World"]));
        let out = Outcomes::default();
        c.post(ENDPOINT, &msgs(), out.options()).await;

        let done = out.finished();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].content, "Hello World");
        assert_eq!(done[0].role, Role::Assistant);
        assert_eq!(done[0].id, "random-id");
        assert!(out.errors().is_empty());
    }

    #[tokio::test]
    async fn immediate_end_of_stream_finishes_empty() {
        let c = client(ScriptedTransport::ok(&[]));
        let out = Outcomes::default();
        c.post(ENDPOINT, &msgs(), out.options()).await;
        assert_eq!(out.finished()[0].content, "");
        assert!(out.errors().is_empty());
    }

    #[tokio::test]
    async fn non_200_reports_status_without_reading_body() {
        let reads = Arc::new(AtomicUsize::new(0));
        let r = reads.clone();
        let body: ByteStream = Box::pin(
            stream::iter(vec![Ok(Bytes::from_static(b"nope"))])
                .inspect(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                }),
        );
        let c = client(ScriptedTransport::new(Reply::Status(404, Some(body))));
        let out = Outcomes::default();
        c.post(ENDPOINT, &msgs(), out.options()).await;

        assert_eq!(out.errors(), vec![ChatError::Status(404)]);
        assert_eq!(out.errors()[0].to_string(), "Received status 404");
        assert!(out.finished().is_empty());
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_body_is_an_error() {
        let c = client(ScriptedTransport::new(Reply::Status(200, None)));
        let out = Outcomes::default();
        c.post(ENDPOINT, &msgs(), out.options()).await;
        assert_eq!(out.errors(), vec![ChatError::NoBody]);
        assert!(out.finished().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_reaches_on_error() {
        let c = client(ScriptedTransport::new(Reply::Fail(ChatError::Transport(
            "Network error".into(),
        ))));
        let out = Outcomes::default();
        c.post(ENDPOINT, &msgs(), out.options()).await;
        assert_eq!(out.errors(), vec![ChatError::Transport("Network error".into())]);
        assert!(out.finished().is_empty());
    }

    #[tokio::test]
    async fn mid_stream_failure_discards_partial_content() {
        let body: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(ChatError::Transport("reset".into())),
            Ok(Bytes::from_static(b"never")),
        ]));
        let c = client(ScriptedTransport::new(Reply::Status(200, Some(body))));
        let out = Outcomes::default();
        c.post(ENDPOINT, &msgs(), out.options()).await;
        assert_eq!(out.errors(), vec![ChatError::Transport("reset".into())]);
        assert!(out.finished().is_empty());
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_decode_error_with_strict_decoder() {
        let body: ByteStream = Box::pin(stream::iter(vec![Ok(Bytes::from_static(&[0xff, 0xfe]))]));
        let c = client(ScriptedTransport::new(Reply::Status(200, Some(body))))
            .with_decoder(Utf8Decoder::strict());
        let out = Outcomes::default();
        c.post(ENDPOINT, &msgs(), out.options()).await;
        assert!(matches!(out.errors().as_slice(), [ChatError::Decode(_)]));
        assert!(out.finished().is_empty());
    }

    #[tokio::test]
    async fn default_decoder_replaces_invalid_bytes() {
        let body: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"caf\xe9")),
            Ok(Bytes::from_static(b" ok")),
        ]));
        let c = client(ScriptedTransport::new(Reply::Status(200, Some(body))));
        let out = Outcomes::default();
        c.post(ENDPOINT, &msgs(), out.options()).await;
        assert_eq!(out.finished()[0].content, "caf\u{FFFD} ok");
        assert!(out.errors().is_empty());
    }

    #[tokio::test]
    async fn spawned_post_fires_its_callback() {
        let c = Arc::new(client(ScriptedTransport::ok(&["from", " a task"])));
        let (tx, rx) = oneshot::channel();
        let opts = RequestOptions::new().on_finish(move |m| {
            let _ = tx.send(m);
        });
        let task = tokio::spawn({
            let c = c.clone();
            async move {
                let messages = msgs();
                c.post(ENDPOINT, &messages, opts).await;
            }
        });
        task.await.unwrap();
        assert_eq!(rx.await.unwrap().content, "from a task");
    }

    #[tokio::test]
    async fn spawned_complete_returns_the_message() {
        let c = Arc::new(client(ScriptedTransport::ok(&["done"])));
        let msg = tokio::spawn({
            let c = c.clone();
            async move {
                let messages = msgs();
                let opts = RequestOptions::new();
                c.complete(ENDPOINT, &messages, &opts).await
            }
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(msg.content, "done");
    }

    #[tokio::test]
    async fn spawned_cancellable_post_can_be_superseded_from_another_task() {
        let (tx, rx) = mpsc::unbounded::<Result<Bytes, ChatError>>();
        let c = Arc::new(client(ScriptedTransport::new(Reply::Status(200, Some(Box::pin(rx))))));
        let coordinator = CancellationCoordinator::new();
        let token = coordinator.start_new_operation();
        let out = Outcomes::default();

        let task = tokio::spawn({
            let (c, token, opts) = (c.clone(), token.clone(), out.options());
            async move {
                let messages = msgs();
                c.post_cancellable(ENDPOINT, &messages, opts, &token).await;
            }
        });
        tx.unbounded_send(Ok(Bytes::from_static(b"partial"))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.start_new_operation();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("task ends once superseded")
            .unwrap();

        assert!(token.is_cancelled());
        assert!(out.finished().is_empty());
        assert!(out.errors().is_empty());
    }

    #[tokio::test]
    async fn missing_callbacks_are_dropped_silently() {
        let c = client(ScriptedTransport::new(Reply::Status(500, None)));
        c.post(ENDPOINT, &msgs(), RequestOptions::new()).await;
        let c = client(ScriptedTransport::ok(&["x"]));
        c.post(ENDPOINT, &msgs(), RequestOptions::new()).await;
    }

    #[tokio::test]
    async fn request_shape_follows_options() {
        let t = ScriptedTransport::ok(&["ok"]);
        let c = client(t);
        let messages = vec![OutgoingMessage::user("hi").with_field("name", json!("alice"))];
        let opts = RequestOptions::new()
            .header("X-Api-Key", "k")
            .body_field("model", json!("m1"));
        c.complete(ENDPOINT, &messages, &opts).await.unwrap();

        let seen = c.transport().requests();
        assert_eq!(seen.len(), 1);
        let req = &seen[0];
        assert_eq!(req.method, "POST");
        assert_eq!(req.url, ENDPOINT);
        assert!(req
            .headers
            .contains(&("Content-Type".into(), "application/json".into())));
        assert!(req.headers.contains(&("X-Api-Key".into(), "k".into())));
        let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(
            body,
            json!({"model": "m1", "messages": [{"content": "hi", "role": "user"}]})
        );
    }

    #[tokio::test]
    async fn extra_message_fields_pass_through_when_enabled() {
        let c = client(ScriptedTransport::ok(&["ok"]));
        let messages = vec![OutgoingMessage::user("hi").with_field("name", json!("alice"))];
        let opts = RequestOptions::new().send_extra_message_fields(true);
        c.complete(ENDPOINT, &messages, &opts).await.unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(&c.transport().requests()[0].body).unwrap();
        assert_eq!(body["messages"][0], json!({"content": "hi", "role": "user", "name": "alice"}));
    }

    #[tokio::test]
    async fn invalid_endpoint_never_reaches_transport() {
        let c = client(ScriptedTransport::ok(&["x"]));
        let out = Outcomes::default();
        c.post("not a url", &msgs(), out.options()).await;
        assert!(matches!(out.errors().as_slice(), [ChatError::InvalidRequest(_)]));
        assert!(c.transport().requests().is_empty());
    }

    #[tokio::test]
    async fn idle_stream_times_out() {
        let body: ByteStream = Box::pin(stream::pending());
        let c = client(ScriptedTransport::new(Reply::Status(200, Some(body))))
            .with_idle_timeout(Some(Duration::from_millis(20)));
        let err = c.complete(ENDPOINT, &msgs(), &RequestOptions::new()).await.unwrap_err();
        assert!(matches!(err, ChatError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_request() {
        let coordinator = CancellationCoordinator::new();
        let token = coordinator.start_new_operation();
        coordinator.abort_current_operation();

        let c = client(ScriptedTransport::ok(&["x"]));
        let out = Outcomes::default();
        c.post_cancellable(ENDPOINT, &msgs(), out.options(), &token).await;
        assert!(c.transport().requests().is_empty());
        assert!(out.finished().is_empty());
        assert!(out.errors().is_empty());
    }

    #[tokio::test]
    async fn superseded_stream_fires_no_callback() {
        let (tx, rx) = mpsc::unbounded::<Result<Bytes, ChatError>>();
        let c = client(ScriptedTransport::new(Reply::Status(200, Some(Box::pin(rx)))));
        let coordinator = CancellationCoordinator::new();
        let token = coordinator.start_new_operation();
        let out = Outcomes::default();

        let messages = msgs();
        let driver = c.post_cancellable(ENDPOINT, &messages, out.options(), &token);
        let supersede = async {
            tx.unbounded_send(Ok(Bytes::from_static(b"first"))).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            let next = coordinator.start_new_operation();
            // the stream would still deliver and close normally
            let _ = tx.unbounded_send(Ok(Bytes::from_static(b"late")));
            tx.close_channel();
            next
        };
        let ((), next) = tokio::join!(driver, supersede);

        assert!(token.is_cancelled());
        assert!(!next.is_cancelled());
        assert!(out.finished().is_empty());
        assert!(out.errors().is_empty());
    }

    #[tokio::test]
    async fn live_token_lets_stream_finish() {
        let coordinator = CancellationCoordinator::new();
        let token = coordinator.start_new_operation();
        let c = client(ScriptedTransport::ok(&["a", "b"]));
        let out = Outcomes::default();
        c.post_cancellable(ENDPOINT, &msgs(), out.options(), &token).await;
        assert_eq!(out.finished()[0].content, "ab");
        assert!(!coordinator.should_abort());
    }

    #[tokio::test]
    async fn concurrent_posts_keep_separate_accumulators() {
        let a = client(ScriptedTransport::ok(&["one", "-a"]));
        let b = client(ScriptedTransport::ok(&["two", "-b"]));
        let (oa, ob) = (Outcomes::default(), Outcomes::default());
        let (ma, mb) = (msgs(), msgs());
        tokio::join!(
            a.post(ENDPOINT, &ma, oa.options()),
            b.post(ENDPOINT, &mb, ob.options()),
        );
        assert_eq!(oa.finished()[0].content, "one-a");
        assert_eq!(ob.finished()[0].content, "two-b");
    }
}
