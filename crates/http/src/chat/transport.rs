use crate::chat::config::TransportConfig;
use futures::StreamExt;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, Method,
};
use stream_core::llm::{ChatError, HttpRequest, Transport, TransportResponse};
use tracing::{debug, error};

/// [`Transport`] backed by a pooled reqwest client.
#[derive(Clone)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new(cfg: &TransportConfig) -> anyhow::Result<Self> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .user_agent(cfg.user_agent.clone())
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .pool_max_idle_per_host(2)
            .connect_timeout(cfg.connect_timeout);
        if let Some(t) = cfg.timeout {
            builder = builder.timeout(t);
        }
        if let Some(p) = &cfg.proxy {
            builder = builder.proxy(reqwest::Proxy::all(p)?);
        }
        let http = builder.build()?;
        Ok(Self { http })
    }

    pub fn from_client(http: Client) -> Self {
        Self { http }
    }

    fn header_map(headers: &[(String, String)]) -> Result<HeaderMap, ChatError> {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (k, v) in headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| ChatError::InvalidRequest(format!("header name {k:?}: {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| ChatError::InvalidRequest(format!("header {k}: {e}")))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<TransportResponse, ChatError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ChatError::InvalidRequest(e.to_string()))?;
        let headers = Self::header_map(&request.headers)?;
        debug!(target: "chatstream::transport", "{} {} body_len={}", method, request.url, request.body.len());

        let resp = self
            .http
            .request(method, &request.url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                error!(target: "chatstream::transport", "send failed url={}: {}", request.url, e);
                map_reqwest_err(e)
            })?;

        let status = resp.status().as_u16();
        let mut stream = resp.bytes_stream();
        let body = async_stream::stream! {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(b) => yield Ok(b),
                    Err(e) => {
                        error!(target: "chatstream::transport", "body read failed: {}", e);
                        yield Err(map_reqwest_err(e));
                        break;
                    }
                }
            }
        };
        Ok(TransportResponse::new(status, Some(Box::pin(body))))
    }
}

fn map_reqwest_err(e: reqwest::Error) -> ChatError {
    if e.is_timeout() {
        ChatError::Timeout(e.to_string())
    } else if e.is_builder() {
        ChatError::InvalidRequest(e.to_string())
    } else {
        ChatError::Transport(e.to_string())
    }
}
