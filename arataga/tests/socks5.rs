//! End-to-end SOCKS5 scenarios: method selection, username/password
//! sub-negotiation, command PDU validation, CONNECT and BIND.

mod common;

use std::net::Ipv4Addr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{read_exact, read_to_end, spawn_echo_target, TestProxy};

fn user_list_with_login(port: u16) -> String {
    format!(
        "127.0.0.1 {port} 127.0.0.1 = 0 0 0 7\n\
         127.0.0.1 {port} user 12345 = 0 0 0 8\n"
    )
}

async fn negotiate_no_auth(client: &mut TcpStream) {
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_exact(client, 2).await, vec![0x05, 0x00]);
}

#[tokio::test]
async fn connect_to_hostname_with_username_password() {
    let target_port = spawn_echo_target().await;
    let proxy = TestProxy::start("socks", "", user_list_with_login).await;
    proxy.prime_dns("test.internal", Ipv4Addr::new(127, 0, 0, 1));

    let mut client = proxy.client().await;

    // method selection: username/password is preferred
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    assert_eq!(read_exact(&mut client, 2).await, vec![0x05, 0x02]);

    // RFC 1929 sub-negotiation
    let mut auth_pdu = vec![0x01, 0x04];
    auth_pdu.extend_from_slice(b"user");
    auth_pdu.push(0x05);
    auth_pdu.extend_from_slice(b"12345");
    client.write_all(&auth_pdu).await.unwrap();
    assert_eq!(read_exact(&mut client, 2).await, vec![0x01, 0x00]);

    // CONNECT to a domain name
    let mut command = vec![0x05, 0x01, 0x00, 0x03, 13];
    command.extend_from_slice(b"test.internal");
    command.extend_from_slice(&target_port.to_be_bytes());
    client.write_all(&command).await.unwrap();

    // positive reply: VER REP RSV ATYP(IPv4) BND.ADDR BND.PORT
    let reply = read_exact(&mut client, 10).await;
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    // BND.ADDR is the local endpoint of the outbound socket, bound to the
    // egress address
    assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
    let bnd_port = u16::from_be_bytes([reply[8], reply[9]]);
    assert_ne!(bnd_port, 0);

    // bidirectional transfer through the tunnel
    let block = vec![0xA5u8; 16 * 1024];
    for _ in 0..8 {
        client.write_all(&block).await.unwrap();
        let echoed = read_exact(&mut client, block.len()).await;
        assert_eq!(echoed, block);
    }
}

#[tokio::test]
async fn unsupported_atype_is_rejected() {
    let proxy = TestProxy::start("socks", "", user_list_with_login).await;
    let mut client = proxy.client().await;

    negotiate_no_auth(&mut client).await;

    // command PDU with ATYP 0x06
    client
        .write_all(&[0x05, 0x01, 0x00, 0x06, 1, 2, 3, 4, 0x00, 0x50])
        .await
        .unwrap();

    let rest = read_to_end(&mut client).await;
    assert_eq!(rest, vec![0x05, 0x08, 0x00, 0x00]);
}

#[tokio::test]
async fn unsupported_command_is_rejected_after_curl_style_auth() {
    let proxy = TestProxy::start("socks", "", user_list_with_login).await;
    let mut client = proxy.client().await;

    negotiate_no_auth(&mut client).await;

    // curl quirk: an empty username/password PDU after no-auth selection
    client.write_all(&[0x01, 0x00, 0x00]).await.unwrap();
    assert_eq!(read_exact(&mut client, 2).await, vec![0x01, 0x00]);

    // UDP-ASSOCIATE is not supported
    client
        .write_all(&[0x05, 0x03, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
        .await
        .unwrap();

    let rest = read_to_end(&mut client).await;
    assert_eq!(rest, vec![0x05, 0x07, 0x00, 0x00]);
}

#[tokio::test]
async fn trailing_garbage_in_command_pdu_closes_the_connection() {
    let proxy = TestProxy::start("socks", "", user_list_with_login).await;
    let mut client = proxy.client().await;

    negotiate_no_auth(&mut client).await;

    // a correct CONNECT PDU with one extra byte appended
    let mut command = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
    command.push(0xFF);
    client.write_all(&command).await.unwrap();

    // no reply, just a close
    assert_eq!(read_to_end(&mut client).await, Vec::<u8>::new());
}

#[tokio::test]
async fn bind_accepts_only_the_requested_peer() {
    let proxy = TestProxy::start("socks", "", user_list_with_login).await;
    let mut client = proxy.client().await;

    negotiate_no_auth(&mut client).await;

    // Firefox quirk: the command PDU comes right after method selection,
    // with no empty auth PDU in between.
    let mut command = vec![0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1];
    command.extend_from_slice(&9999u16.to_be_bytes());
    client.write_all(&command).await.unwrap();

    // first reply: the endpoint the proxy listens on
    let reply = read_exact(&mut client, 10).await;
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    let listen_port = u16::from_be_bytes([reply[8], reply[9]]);

    // the awaited peer connects
    let mut peer = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();

    // second reply: the endpoint of the accepted peer
    let reply = read_exact(&mut client, 10).await;
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

    // relay works both ways
    peer.write_all(b"from-peer").await.unwrap();
    assert_eq!(read_exact(&mut client, 9).await, b"from-peer".to_vec());

    client.write_all(b"from-client").await.unwrap();
    let mut received = vec![0u8; 11];
    peer.read_exact(&mut received).await.unwrap();
    assert_eq!(received, b"from-client".to_vec());
}

#[tokio::test]
async fn slow_byte_by_byte_handshake_still_completes() {
    let proxy = TestProxy::start("socks", "", user_list_with_login).await;
    let mut client = proxy.client().await;

    // One byte at a time is fine as long as the whole handshake fits the
    // phase timeout.
    for byte in [0x05u8, 0x01, 0x02] {
        client.write_all(&[byte]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    assert_eq!(read_exact(&mut client, 2).await, vec![0x05, 0x02]);
}

#[tokio::test]
async fn unknown_credentials_are_refused() {
    let proxy = TestProxy::start("socks", "", user_list_with_login).await;
    let mut client = proxy.client().await;

    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    assert_eq!(read_exact(&mut client, 2).await, vec![0x05, 0x02]);

    let mut auth_pdu = vec![0x01, 0x04];
    auth_pdu.extend_from_slice(b"user");
    auth_pdu.push(0x05);
    auth_pdu.extend_from_slice(b"wrong");
    client.write_all(&auth_pdu).await.unwrap();
    // sub-negotiation itself succeeds; the credentials are carried to the
    // command stage
    assert_eq!(read_exact(&mut client, 2).await, vec![0x01, 0x00]);

    let command = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
    client.write_all(&command).await.unwrap();

    // authentication fails: connection-not-allowed, then close
    let rest = read_to_end(&mut client).await;
    assert_eq!(rest, vec![0x05, 0x02, 0x00, 0x00]);
}
