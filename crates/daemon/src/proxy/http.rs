/// HTTP proxy server feeding the circuit
///
/// Speaks enough HTTP to be a browser proxy: absolute-URI requests are
/// rewritten to origin form, downgraded to HTTP/1.0 with Connection:
/// close so the response ends with the stream, and CONNECT is tunneled
/// verbatim.

use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};
use veilnet_core::{OriginCircuit, StreamError};

pub struct HttpProxy {
    listen_addr: SocketAddr,
    circuit: Arc<OriginCircuit>,
}

impl HttpProxy {
    pub fn new(listen_addr: SocketAddr, circuit: Arc<OriginCircuit>) -> Self {
        Self {
            listen_addr,
            circuit,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!("HTTP proxy listening on {}", self.listen_addr);

        loop {
            let (socket, peer) = listener.accept().await?;
            debug!("HTTP proxy: connection from {}", peer);

            let circuit = self.circuit.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(circuit, socket).await {
                    debug!("HTTP proxy: {} failed: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_client(circuit: Arc<OriginCircuit>, socket: TcpStream) -> Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end().to_string();
        if line.is_empty() {
            break;
        }
        headers.push(line);
    }

    let method = request_line
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();

    if method.eq_ignore_ascii_case("CONNECT") {
        let target = request_line
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| anyhow!("malformed CONNECT request"))?;
        let (host, port) = split_host_port(target, 443)?;

        let mut stream = match circuit.open_stream(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                send_error(&mut write_half, 502, "Bad Gateway").await?;
                return Err(anyhow!("CONNECT to {}:{} failed: {}", host, port, e));
            }
        };

        write_half
            .write_all(b"HTTP/1.0 200 Connection Established\r\n\r\n")
            .await?;
        stream.tunnel(reader, write_half).await;
        return Ok(());
    }

    let request = match rewrite_request(&request_line, &headers) {
        Ok(request) => request,
        Err(e) => {
            send_error(&mut write_half, 400, "Bad Request").await?;
            return Err(e);
        }
    };
    debug!(
        "HTTP proxy: {} {}:{}",
        method, request.host, request.port
    );

    let mut stream = match circuit.open_stream(&request.host, request.port).await {
        Ok(stream) => stream,
        Err(StreamError::Refused) => {
            send_error(&mut write_half, 502, "Bad Gateway").await?;
            return Err(anyhow!("destination refused"));
        }
        Err(e) => {
            send_error(&mut write_half, 503, "Service Unavailable").await?;
            return Err(anyhow!("stream open failed: {}", e));
        }
    };

    stream
        .write(request.head.as_bytes())
        .map_err(|e| anyhow!("request send failed: {}", e))?;

    // any request body plus the whole response flow through the tunnel
    stream.tunnel(reader, write_half).await;
    Ok(())
}

/// A proxied request rewritten for direct delivery to the origin server.
#[derive(Debug, PartialEq, Eq)]
struct ProxyRequest {
    host: String,
    port: u16,
    head: String,
}

/// Rewrite a proxy-form request head into origin form: absolute URI
/// reduced to its path, version pinned to HTTP/1.0, hop-by-hop
/// connection headers replaced with Connection: close.
fn rewrite_request(request_line: &str, headers: &[String]) -> Result<ProxyRequest> {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("empty request line"))?;
    let url = parts.next().ok_or_else(|| anyhow!("missing request URL"))?;

    let (target, path) = match url.strip_prefix("http://") {
        Some(rest) => match rest.find('/') {
            Some(idx) => (rest[..idx].to_string(), rest[idx..].to_string()),
            None => (rest.to_string(), "/".to_string()),
        },
        // origin-form URL: the Host header names the destination
        None => {
            let host = headers
                .iter()
                .find_map(|h| h.strip_prefix("Host:").or_else(|| h.strip_prefix("host:")))
                .map(|h| h.trim().to_string())
                .ok_or_else(|| anyhow!("origin-form request without Host header"))?;
            (host, url.to_string())
        }
    };
    let (host, port) = split_host_port(&target, 80)?;

    let mut head = format!("{} {} HTTP/1.0\r\n", method, path);
    let mut saw_host = false;
    for header in headers {
        let name = header.split(':').next().unwrap_or_default().trim();
        if name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("proxy-connection")
            || name.eq_ignore_ascii_case("keep-alive")
        {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            saw_host = true;
        }
        head.push_str(header);
        head.push_str("\r\n");
    }
    if !saw_host {
        head.push_str(&format!("Host: {}\r\n", target));
    }
    head.push_str("Connection: close\r\n\r\n");

    Ok(ProxyRequest { host, port, head })
}

fn split_host_port(target: &str, default_port: u16) -> Result<(String, u16)> {
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow!("bad port in {:?}", target))?;
            Ok((host.to_string(), port))
        }
        _ => {
            if target.is_empty() {
                return Err(anyhow!("empty destination"));
            }
            Ok((target.to_string(), default_port))
        }
    }
}

async fn send_error<W: AsyncWriteExt + Unpin>(
    write_half: &mut W,
    code: u16,
    reason: &str,
) -> Result<()> {
    let response = format!(
        "HTTP/1.0 {} {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        code, reason
    );
    write_half.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_absolute_uri_is_reduced_to_path() {
        let request = rewrite_request(
            "GET http://example.com/page?q=1 HTTP/1.1\r\n",
            &headers(&["Host: example.com", "Accept: */*"]),
        )
        .unwrap();

        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, 80);
        assert!(request.head.starts_with("GET /page?q=1 HTTP/1.0\r\n"));
        assert!(request.head.contains("Host: example.com\r\n"));
        assert!(request.head.contains("Accept: */*\r\n"));
    }

    #[test]
    fn test_downgrade_replaces_connection_headers() {
        let request = rewrite_request(
            "GET http://example.com/ HTTP/1.1\r\n",
            &headers(&[
                "Host: example.com",
                "Connection: keep-alive",
                "Proxy-Connection: keep-alive",
                "Keep-Alive: timeout=5",
            ]),
        )
        .unwrap();

        assert!(!request.head.contains("keep-alive"));
        assert!(request.head.ends_with("Connection: close\r\n\r\n"));
        assert_eq!(request.head.matches("Connection:").count(), 1);
    }

    #[test]
    fn test_explicit_port() {
        let request = rewrite_request(
            "GET http://example.com:8080/x HTTP/1.1\r\n",
            &headers(&["Host: example.com:8080"]),
        )
        .unwrap();
        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, 8080);
    }

    #[test]
    fn test_origin_form_uses_host_header() {
        let request = rewrite_request(
            "GET /path HTTP/1.1\r\n",
            &headers(&["Host: internal.test:9000"]),
        )
        .unwrap();
        assert_eq!(request.host, "internal.test");
        assert_eq!(request.port, 9000);
        assert!(request.head.starts_with("GET /path HTTP/1.0\r\n"));
    }

    #[test]
    fn test_host_header_added_when_missing() {
        let request = rewrite_request("GET http://example.com/ HTTP/1.1\r\n", &[]).unwrap();
        assert!(request.head.contains("Host: example.com\r\n"));
    }

    #[test]
    fn test_origin_form_without_host_is_rejected() {
        assert!(rewrite_request("GET /path HTTP/1.1\r\n", &[]).is_err());
    }

    #[test]
    fn test_bare_authority_gets_root_path() {
        let request = rewrite_request("GET http://example.com HTTP/1.1\r\n", &[]).unwrap();
        assert!(request.head.starts_with("GET / HTTP/1.0\r\n"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:443", 80).unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_host_port("example.com", 443).unwrap(),
            ("example.com".to_string(), 443)
        );
        assert!(split_host_port("example.com:x", 80).is_err());
        assert!(split_host_port("", 80).is_err());
    }
}
