//! Shared harness for the end-to-end proxy tests: an in-process proxy
//! with one ACL on 127.0.0.1 and helper targets to talk to.

// Each test binary uses its own subset of the helpers.
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use arataga::acl::AclDispatcher;
use arataga::config::parse_config;
use arataga::dns::DnsResolver;
use arataga::user_list::parse_auth_data;

pub struct TestProxy {
    pub dispatcher: Arc<AclDispatcher>,
    pub port: u16,
    shutdown: CancellationToken,
}

impl TestProxy {
    /// Starts a proxy with one ACL (`protocol`) on an ephemeral port.
    ///
    /// `extra_cfg` is inserted verbatim into the config text;
    /// `user_list` receives the ACL port and produces the user-list text.
    pub async fn start(
        protocol: &str,
        extra_cfg: &str,
        user_list: impl FnOnce(u16) -> String,
    ) -> Self {
        let port = free_port().await;

        let cfg_text = format!(
            "nserver 127.0.0.1\n\
             timeout.failed_auth_reply 50ms\n\
             {extra_cfg}\n\
             acl {protocol}, port={port}, in_ip=127.0.0.1, out_ip=127.0.0.1\n"
        );
        let cfg = parse_config(&cfg_text).expect("test config must parse");
        let auth_data = parse_auth_data(&user_list(port)).expect("test user-list must parse");

        let shutdown = CancellationToken::new();
        let dispatcher = AclDispatcher::new(1, shutdown.clone());
        dispatcher.apply_config(&cfg);
        dispatcher.apply_user_list(&auth_data);

        wait_for_listener(port).await;

        Self { dispatcher, port, shutdown }
    }

    pub async fn client(&self) -> TcpStream {
        TcpStream::connect(("127.0.0.1", self.port))
            .await
            .expect("proxy must accept connections")
    }

    pub fn dns(&self) -> Arc<DnsResolver> {
        Arc::clone(&self.dispatcher.context(0).dns)
    }

    /// Seeds the DNS cache so hostname targets resolve without real DNS.
    pub fn prime_dns(&self, hostname: &str, addr: Ipv4Addr) {
        self.dns().add_records(hostname, [IpAddr::V4(addr)]);
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binding an ephemeral port");
    listener.local_addr().unwrap().port()
}

async fn wait_for_listener(port: u16) {
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("proxy listener on port {port} never became ready");
}

/// A target that echoes every byte back, one connection at a time.
pub async fn spawn_echo_target() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });

    port
}

/// An HTTP target: captures every received request (head + body, raw
/// bytes) and answers each connection with `response`.
pub async fn spawn_http_target(response: &'static str) -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (captured_tx, captured_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let captured_tx = captured_tx.clone();
            tokio::spawn(async move {
                let request = read_http_request(&mut stream).await;
                let _ = captured_tx.send(request);
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    (port, captured_rx)
}

/// A target that writes `bytes` immediately and closes, never reading the
/// request to completion.
pub async fn spawn_broken_target(bytes: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let _ = stream.write_all(bytes).await;
                // dropping the stream closes it
            });
        }
    });

    port
}

/// Reads one complete HTTP request: the head, then a Content-Length body
/// or a chunked body up to the last-chunk marker.
async fn read_http_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find(&data, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return data;
        }
        data.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&data[..head_end]).into_owned();
    let head_lower = head.to_ascii_lowercase();

    if head_lower.contains("transfer-encoding: chunked") {
        while find(&data[head_end..], b"0\r\n\r\n").is_none() {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return data;
            }
            data.extend_from_slice(&chunk[..n]);
        }
    } else if let Some(length) = content_length(&head_lower) {
        while data.len() < head_end + length {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return data;
            }
            data.extend_from_slice(&chunk[..n]);
        }
    }

    data
}

fn content_length(head_lower: &str) -> Option<usize> {
    head_lower
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse().ok())
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Reads until EOF.
pub async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let _ = stream.read_to_end(&mut data).await;
    data
}

/// Reads exactly `n` bytes.
pub async fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut data = vec![0u8; n];
    stream
        .read_exact(&mut data)
        .await
        .expect("peer closed before the expected bytes arrived");
    data
}

/// Reads until the byte sequence `needle` has been seen; returns all
/// collected bytes.
pub async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if find(&data, needle).is_some() {
            return data;
        }
        let n = stream.read(&mut chunk).await.expect("read failure");
        if n == 0 {
            return data;
        }
        data.extend_from_slice(&chunk[..n]);
    }
}
