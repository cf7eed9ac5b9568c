pub mod chat;

pub use chat::client::StreamingClient;
pub use chat::config::TransportConfig;
pub use chat::options::RequestOptions;
pub use chat::transport::ReqwestTransport;
