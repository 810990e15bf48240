//! Cleartext traffic: absolute-URI requests and CONNECT tunnels without TLS.

mod common;

use common::{echo_handler, test_client, RecordingListener, TestCa, TestProxy, TestUpstream};
use tlsplice_test_support::test_report;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_absolute_uri_request_forwarded_and_reported() {
    let t = test_report!("Plain HTTP request is forwarded and reported as HTTP/1.1");
    let ca = TestCa::generate();
    let upstream = TestUpstream::start_plain(echo_handler()).await;
    let listener = RecordingListener::new();
    let proxy = TestProxy::with_listener(&ca, upstream.port(), listener.clone()).await;

    let client = test_client(proxy.addr(), &ca);
    let url = format!("http://localhost:{}/plain?q=1", upstream.port());
    t.action(format!("POST {}", url));
    let resp = client
        .post(&url)
        .header("Proxy-Connection", "keep-alive")
        .body("hello")
        .send()
        .await
        .unwrap();

    t.assert_eq("status", &resp.status().as_u16(), &200u16);
    let body = resp.text().await.unwrap();
    t.output("upstream saw", &body);
    t.assert_contains("method", &body, "method=POST");
    t.assert_contains("origin-form path", &body, "path=/plain");
    t.assert_contains("host", &body, &format!("host=localhost:{}", upstream.port()));
    t.assert_contains("body", &body, "body_len=5");

    let events = listener.wait_for_events(1).await;
    t.assert_eq("one event", &events.len(), &1usize);
    t.assert_eq("version", &events[0].version, &"HTTP/1.1");
    t.assert_eq("path", &events[0].path.as_str(), &"/plain?q=1");
    t.assert_eq("request bytes", &events[0].request_body_size, &5u64);

    proxy.shutdown();
    upstream.shutdown();
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let t = test_report!("Plain HTTP to a closed port answers 502");
    let ca = TestCa::generate();
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);
    let proxy = TestProxy::start(&ca, port).await;

    let client = test_client(proxy.addr(), &ca);
    let resp = client
        .get(format!("http://localhost:{}/", port))
        .send()
        .await
        .unwrap();
    t.assert_eq("status", &resp.status().as_u16(), &502u16);

    proxy.shutdown();
}

/// Read an HTTP head off the stream, returning it and any bytes after it.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed inside response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn test_connect_without_tls_is_forwarded() {
    let t = test_report!("A CONNECT tunnel carrying cleartext is relayed byte for byte");
    let ca = TestCa::generate();
    let upstream = TestUpstream::start_plain(echo_handler()).await;
    let listener = RecordingListener::new();
    let proxy = TestProxy::with_listener(&ca, upstream.port(), listener.clone()).await;

    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    t.action("CONNECT localhost:80");
    stream
        .write_all(b"CONNECT localhost:80 HTTP/1.1\r\nHost: localhost:80\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    t.assert_contains("tunnel established", &head, "200");

    t.action("Speak HTTP/1.1 in the clear through the tunnel");
    stream
        .write_all(b"GET /raw HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    let reply = String::from_utf8_lossy(&reply);
    t.output("reply", &reply);
    t.assert_contains("status line", &reply, "HTTP/1.1 200");
    t.assert_contains("relayed body", &reply, "path=/raw");

    // Forwarded pairs are opaque, so nothing is reported.
    t.assert_true("no events", listener.events().is_empty());
    t.assert_eq("upstream hits", &upstream.hits(), &1usize);

    proxy.shutdown();
    upstream.shutdown();
}
