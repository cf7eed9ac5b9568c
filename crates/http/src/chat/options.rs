use serde_json::{Map, Value};
use stream_core::llm::{ChatError, ChatMessage, OutgoingMessage};

pub type FinishCallback = Box<dyn FnOnce(ChatMessage) + Send>;
pub type ErrorCallback = Box<dyn FnOnce(ChatError) + Send>;

pub const DEFAULT_CONTENT_TYPE: (&str, &str) = ("Content-Type", "application/json");

/// Per-request settings. The callbacks are `FnOnce`, so each fires at most
/// once per [`post`](crate::StreamingClient::post).
#[derive(Default)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub body: Map<String, Value>,
    pub send_extra_message_fields: bool,
    pub on_finish: Option<FinishCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body_field<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    pub fn send_extra_message_fields(mut self, yes: bool) -> Self {
        self.send_extra_message_fields = yes;
        self
    }

    pub fn on_finish<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ChatMessage) + Send + 'static,
    {
        self.on_finish = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ChatError) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn into_callbacks(self) -> (Option<FinishCallback>, Option<ErrorCallback>) {
        (self.on_finish, self.on_error)
    }

    /// Default content type with caller headers merged over it. Names compare
    /// case-insensitively; a later entry replaces an earlier one.
    pub fn merged_headers(&self) -> Vec<(String, String)> {
        let mut out = vec![(
            DEFAULT_CONTENT_TYPE.0.to_string(),
            DEFAULT_CONTENT_TYPE.1.to_string(),
        )];
        for (k, v) in &self.headers {
            match out.iter_mut().find(|(name, _)| name.eq_ignore_ascii_case(k)) {
                Some(slot) => *slot = (k.clone(), v.clone()),
                None => out.push((k.clone(), v.clone())),
            }
        }
        out
    }

    /// Caller body fields plus `messages`, which always overrides a
    /// same-named body field.
    pub fn payload(&self, messages: &[OutgoingMessage]) -> Value {
        let mut obj = self.body.clone();
        let msgs = messages
            .iter()
            .map(|m| m.to_wire(self.send_extra_message_fields))
            .collect();
        obj.insert("messages".into(), Value::Array(msgs));
        Value::Object(obj)
    }
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("send_extra_message_fields", &self.send_extra_message_fields)
            .field("on_finish", &self.on_finish.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
