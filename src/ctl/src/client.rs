use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::net::TcpStream;

pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Minimal HTTP/1.1 client for one node's JSON API
pub struct Client {
    authority: String,
}

impl Client {
    pub fn new(host: &str, port: u16) -> Self {
        Client {
            authority: format!("{}:{}", host, port),
        }
    }

    /// Sends one request and returns the status with the raw body
    pub async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<(StatusCode, Bytes), Error> {
        let stream = TcpStream::connect(&self.authority).await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                eprintln!("Connection error: {}", e);
            }
        });

        let payload = match body {
            Some(value) => Bytes::from(serde_json::to_vec(&value)?),
            None => Bytes::new(),
        };
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, &self.authority)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(payload))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok((status, bytes))
    }

    /// Sends one request and decodes the JSON response body; empty bodies decode to `null`
    pub async fn json(&self, method: Method, path: &str, body: Option<Value>) -> Result<(StatusCode, Value), Error> {
        let (status, bytes) = self.send(method, path, body).await?;
        if bytes.is_empty() {
            return Ok((status, Value::Null));
        }
        let value = serde_json::from_slice(&bytes)?;
        Ok((status, value))
    }
}
