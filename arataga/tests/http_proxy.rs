//! End-to-end HTTP proxy scenarios: keep-alive passthrough, chunked
//! re-framing, negative responses and CONNECT tunnelling.

mod common;

use tokio::io::AsyncWriteExt;

use common::{
    find, read_exact, read_to_end, read_until, spawn_broken_target, spawn_echo_target,
    spawn_http_target, TestProxy,
};

fn user_list(port: u16) -> String {
    format!(
        "127.0.0.1 {port} 127.0.0.1 = 0 0 0 7\n\
         127.0.0.1 {port} user 12345 = 0 0 0 8\n"
    )
}

/// No user at all: every authentication attempt fails.
fn empty_user_list(_port: u16) -> String {
    String::new()
}

#[tokio::test]
async fn keep_alive_passthrough_rewrites_the_request() {
    let (target_port, mut captured) =
        spawn_http_target("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let proxy = TestProxy::start("auto", "", user_list).await;
    let mut client = proxy.client().await;

    let request = format!(
        "GET http://127.0.0.1:{target_port}/ HTTP/1.1\r\n\
         Host: 127.0.0.1:{target_port}\r\n\
         Proxy-Authorization: basic dXNlcjoxMjM0NQ==\r\n\
         Content-Length: 0\r\n\r\n"
    );

    for _ in 0..2 {
        client.write_all(request.as_bytes()).await.unwrap();

        let response = read_until(&mut client, b"\r\n\r\n").await;
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got: {response}");
        assert!(response.contains("Content-Length: 0"));

        let received = captured.recv().await.expect("target never saw the request");
        let received = String::from_utf8_lossy(&received);

        // request-target rewritten to origin-form, Host kept, credentials
        // consumed by the proxy
        assert!(
            received.starts_with(&format!(
                "GET / HTTP/1.1\r\nHost: 127.0.0.1:{target_port}\r\n"
            )),
            "got: {received}"
        );
        assert!(!received.to_ascii_lowercase().contains("proxy-authorization"));
        assert!(received.contains("Content-Length: 0"));
    }
}

#[tokio::test]
async fn chunked_upload_is_reframed_without_extensions() {
    let (target_port, mut captured) = spawn_http_target("HTTP/1.1 200 OK\r\n\r\n").await;
    // The response carries no framing, so the client side would stay in
    // keep-alive until the next-request deadline; keep that short.
    let proxy = TestProxy::start("auto", "timeout.http.headers_complete 300ms", user_list).await;
    let mut client = proxy.client().await;

    let request = format!(
        "POST http://localhost:{target_port}/ HTTP/1.1\r\n\
         Host: localhost:{target_port}\r\n\
         Transfer-Encoding: chunked\r\n\
         Proxy-Authorization: basic dXNlcjoxMjM0NQ==\r\n\r\n\
         4\r\nWiki\r\n5;Ext-One;Ext-Two=Val\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n"
    );
    proxy.prime_dns("localhost", std::net::Ipv4Addr::new(127, 0, 0, 1));
    client.write_all(request.as_bytes()).await.unwrap();

    let received = captured.recv().await.expect("target never saw the request");
    let body_start = find(&received, b"\r\n\r\n").unwrap() + 4;
    assert_eq!(
        &received[body_start..],
        b"4\r\nWiki\r\n5\r\npedia\r\ne\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n"
    );

    // the target's response has no framing, so it is forwarded and the
    // exchange ends when the target closes
    let response = read_to_end(&mut client).await;
    assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn partial_upstream_response_becomes_bad_gateway() {
    let target_port = spawn_broken_target(b"HTT").await;
    let proxy = TestProxy::start("auto", "", user_list).await;
    let mut client = proxy.client().await;

    let request = format!(
        "GET http://127.0.0.1:{target_port}/ HTTP/1.1\r\n\
         Host: 127.0.0.1:{target_port}\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = read_to_end(&mut client).await;
    assert!(
        response.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"),
        "got: {}",
        String::from_utf8_lossy(&response)
    );
}

#[tokio::test]
async fn overlong_request_target_is_a_bad_request() {
    let proxy = TestProxy::start("auto", "http.limits.request_target 100", user_list).await;
    let mut client = proxy.client().await;

    let request = format!(
        "GET /{} HTTP/1.1\r\nHost: localhost\r\n\r\n",
        "x".repeat(200)
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = read_to_end(&mut client).await;
    assert!(
        response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"),
        "got: {}",
        String::from_utf8_lossy(&response)
    );
}

#[tokio::test]
async fn unknown_user_gets_proxy_auth_required() {
    let proxy = TestProxy::start("auto", "", empty_user_list).await;
    let mut client = proxy.client().await;

    client
        .write_all(b"GET http://127.0.0.1:9090/ HTTP/1.1\r\nHost: 127.0.0.1:9090\r\n\r\n")
        .await
        .unwrap();

    let response = read_to_end(&mut client).await;
    assert!(
        response.starts_with(b"HTTP/1.1 407 Proxy Authentication Required\r\n"),
        "got: {}",
        String::from_utf8_lossy(&response)
    );
}

#[tokio::test]
async fn connect_opens_a_tunnel() {
    let target_port = spawn_echo_target().await;
    let proxy = TestProxy::start("auto", "", user_list).await;
    let mut client = proxy.client().await;

    let request = format!(
        "CONNECT 127.0.0.1:{target_port} HTTP/1.1\r\n\
         Host: 127.0.0.1:{target_port}\r\n\
         Proxy-Authorization: basic dXNlcjoxMjM0NQ==\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let reply = read_exact(&mut client, "HTTP/1.1 200 Ok\r\n\r\n".len()).await;
    assert_eq!(reply, b"HTTP/1.1 200 Ok\r\n\r\n".to_vec());

    // opaque payload through the tunnel
    let payload = vec![0x42u8; 16 * 1024];
    for _ in 0..4 {
        client.write_all(&payload).await.unwrap();
        assert_eq!(read_exact(&mut client, payload.len()).await, payload);
    }
}

#[tokio::test]
async fn silent_client_is_closed_without_a_response() {
    let proxy = TestProxy::start(
        "http",
        "timeout.http.headers_complete 200ms",
        user_list,
    )
    .await;
    let mut client = proxy.client().await;

    // no bytes sent at all: the proxy closes silently
    let response = read_to_end(&mut client).await;
    assert_eq!(response, Vec::<u8>::new());
}

#[tokio::test]
async fn stalled_headers_earn_request_timeout() {
    let proxy = TestProxy::start(
        "http",
        "timeout.http.headers_complete 200ms",
        user_list,
    )
    .await;
    let mut client = proxy.client().await;

    client.write_all(b"GET / HTTP/1.1\r\nHos").await.unwrap();

    let response = read_to_end(&mut client).await;
    assert!(
        response.starts_with(b"HTTP/1.1 408 Request Timeout\r\n"),
        "got: {}",
        String::from_utf8_lossy(&response)
    );
}

#[tokio::test]
async fn host_header_fallback_and_port_80_rule() {
    // The Host field of the outgoing request omits the port only when it
    // is 80; a non-default port must be kept.
    let (target_port, mut captured) =
        spawn_http_target("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let proxy = TestProxy::start("auto", "", user_list).await;
    let mut client = proxy.client().await;

    // origin-form request-target: the target comes from the Host field
    let request = format!(
        "GET /path?q=1 HTTP/1.1\r\nHost: 127.0.0.1:{target_port}\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let received = captured.recv().await.expect("target never saw the request");
    let received = String::from_utf8_lossy(&received);
    assert!(
        received.starts_with(&format!(
            "GET /path?q=1 HTTP/1.1\r\nHost: 127.0.0.1:{target_port}\r\n"
        )),
        "got: {received}"
    );
    // Connection is hop-by-hop and must not reach the target
    assert!(!received.to_ascii_lowercase().contains("connection:"));

    // Connection: close means the proxy closes the client side after the
    // response
    let response = read_to_end(&mut client).await;
    assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
}
