//! Raw socket HTTP for unsafe requests
//!
//! Unsafe templates need exact wire bytes (malformed requests, smuggling
//! probes) that a conforming client cannot emit, so they are written
//! straight to a TCP stream, with TLS wrapping for https targets.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{EngineError, ErrorClass, ErrorX, Result};
use crate::http::client::{ResponseChain, ResponseHop};

/// Sends raw request bytes to `address` (`host:port`), reading the response
/// until EOF or the body cap. `sni` is used for the TLS handshake when
/// `tls` is set.
pub async fn send_raw(
    address: &str,
    tls: bool,
    sni: &str,
    raw: &[u8],
    timeout_secs: u64,
    max_body: usize,
) -> Result<ResponseChain> {
    let deadline = Duration::from_secs(timeout_secs);
    let stream = timeout(deadline, TcpStream::connect(address))
        .await
        .map_err(|_| {
            ErrorX::with_class(ErrorClass::Deadline, format!("connect to {address} timed out"))
        })??;

    let response_bytes = if tls {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| ErrorX::from(EngineError::Tls(e)))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let mut stream = timeout(deadline, connector.connect(sni, stream))
            .await
            .map_err(|_| {
                ErrorX::with_class(ErrorClass::Deadline, format!("TLS handshake with {address} timed out"))
            })?
            .map_err(|e| ErrorX::with_class(ErrorClass::NetworkTemporary, e.to_string()))?;
        stream.write_all(raw).await?;
        read_capped(&mut stream, deadline, max_body).await?
    } else {
        let mut stream = stream;
        stream.write_all(raw).await?;
        read_capped(&mut stream, deadline, max_body).await?
    };

    Ok(ResponseChain::from_hops(vec![parse_response(
        &response_bytes,
        address,
    )]))
}

async fn read_capped<S: AsyncReadExt + Unpin>(
    stream: &mut S,
    deadline: Duration,
    max_body: usize,
) -> Result<Vec<u8>> {
    let cap = if max_body == 0 {
        crate::http::client::DEFAULT_MAX_BODY
    } else {
        max_body
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = match timeout(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(n)) => n,
            // Servers that hold the connection open after the response are
            // treated as end of stream.
            Ok(Err(_)) | Err(_) => 0,
        };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() >= cap {
            buf.truncate(cap);
            break;
        }
    }
    Ok(buf)
}

/// Minimal parse of a raw HTTP response into a hop. Unparseable responses
/// are surfaced whole as the body so operators can still inspect them.
fn parse_response(bytes: &[u8], address: &str) -> ResponseHop {
    let text = String::from_utf8_lossy(bytes);
    let (head, body) = match text.split_once("\r\n\r\n") {
        Some((head, body)) => (head, body),
        None => ("", text.as_ref()),
    };

    let mut lines = head.lines();
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();
    let status: u16 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect();

    ResponseHop {
        status,
        version,
        headers,
        body: body.to_string(),
        url: address.to_string(),
        truncated: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_and_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nServer: test\r\nContent-Length: 2\r\n\r\nhi";
        let hop = parse_response(raw, "example.com:80");
        assert_eq!(hop.status, 200);
        assert_eq!(hop.header("server"), Some("test"));
        assert_eq!(hop.body, "hi");
    }

    #[test]
    fn garbage_becomes_body() {
        let hop = parse_response(b"not http at all", "example.com:80");
        assert_eq!(hop.status, 0);
        assert!(hop.body.contains("not http"));
    }
}
