pub mod cancel;
pub mod decode;
pub mod id;

pub use cancel::{CancellationCoordinator, CancellationToken};
pub use decode::{ChunkDecoder, Utf8Decoder};
pub use id::{IdGenerator, NanoId};

pub mod llm {
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use futures::Stream;
    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};
    use thiserror::Error;

    #[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum Role {
        System,
        User,
        Assistant,
    }

    impl Role {
        pub fn as_str(&self) -> &'static str {
            match self {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            }
        }
    }

    /// A message supplied by the caller. Anything besides `content` and `role`
    /// lives in `extra` and is only serialized when the request asks for it.
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    pub struct OutgoingMessage {
        pub content: String,
        pub role: Role,
        #[serde(flatten)]
        pub extra: Map<String, Value>,
    }

    impl OutgoingMessage {
        pub fn new<S: Into<String>>(role: Role, content: S) -> Self {
            Self {
                content: content.into(),
                role,
                extra: Map::new(),
            }
        }
        pub fn user<S: Into<String>>(s: S) -> Self {
            Self::new(Role::User, s)
        }
        pub fn system<S: Into<String>>(s: S) -> Self {
            Self::new(Role::System, s)
        }
        pub fn assistant<S: Into<String>>(s: S) -> Self {
            Self::new(Role::Assistant, s)
        }

        pub fn with_field<K: Into<String>>(mut self, key: K, value: Value) -> Self {
            self.extra.insert(key.into(), value);
            self
        }

        /// JSON shape sent over the wire. `content` and `role` always win over
        /// same-named extra fields.
        pub fn to_wire(&self, send_extra_fields: bool) -> Value {
            let mut obj = if send_extra_fields {
                self.extra.clone()
            } else {
                Map::new()
            };
            obj.insert("content".into(), Value::String(self.content.clone()));
            obj.insert("role".into(), Value::String(self.role.as_str().into()));
            Value::Object(obj)
        }
    }

    /// The assembled result of one completed stream.
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct ChatMessage {
        pub id: String,
        pub content: String,
        pub role: Role,
        pub created_at: DateTime<Utc>,
    }

    impl ChatMessage {
        /// Assistant reply stamped with the current time.
        pub fn assistant<I: Into<String>, S: Into<String>>(id: I, content: S) -> Self {
            Self {
                id: id.into(),
                content: content.into(),
                role: Role::Assistant,
                created_at: Utc::now(),
            }
        }
    }

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum ChatError {
        #[error("Received status {0}")] Status(u16),
        #[error("Response body is null")] NoBody,
        #[error("transport: {0}")] Transport(String),
        #[error("timeout: {0}")] Timeout(String),
        #[error("decode: {0}")] Decode(String),
        #[error("invalid request: {0}")] InvalidRequest(String),
        #[error("canceled")] Canceled,
    }

    pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChatError>> + Send>>;

    use std::pin::Pin;

    #[derive(Clone, Debug)]
    pub struct HttpRequest {
        pub url: String,
        pub method: &'static str,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    pub struct TransportResponse {
        pub status: u16,
        pub body: Option<ByteStream>,
    }

    impl TransportResponse {
        pub fn new(status: u16, body: Option<ByteStream>) -> Self {
            Self { status, body }
        }
    }

    impl std::fmt::Debug for TransportResponse {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TransportResponse")
                .field("status", &self.status)
                .field("has_body", &self.body.is_some())
                .finish()
        }
    }

    /// Sends one request and hands back the status plus a pull-based body.
    #[allow(async_fn_in_trait)]
    pub trait Transport: Send + Sync {
        async fn send(&self, request: HttpRequest) -> Result<TransportResponse, ChatError>;
    }

}
