//! Minimal HTTP client for integration tests.
//!
//! Speaks just enough HTTP/1.1 over a raw TCP stream to POST JSON and
//! read back the status line and body.

#![allow(dead_code)]

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// POST a JSON body and return `(status_code, response_body)`.
pub async fn post_json(
    port: u16,
    path: &str,
    body: &serde_json::Value,
) -> anyhow::Result<(u16, serde_json::Value)> {
    let payload = body.to_string();
    let request = format!(
        "POST {path} HTTP/1.1\r\n\
         Host: 127.0.0.1\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{payload}",
        payload.len()
    );

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let response = String::from_utf8(response)?;

    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("malformed response: {response}"))?
        .parse()?;
    let body_text = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("");
    let body = if body_text.trim().is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(body_text.trim())?
    };
    Ok((status, body))
}

/// GET a path and return `(status_code, response_body_text)`.
pub async fn get(port: u16, path: &str) -> anyhow::Result<(u16, String)> {
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n"
    );
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let response = String::from_utf8(response)?;
    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("malformed response: {response}"))?
        .parse()?;
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}
