use http::{HeaderValue, Method, StatusCode};
use proxy_stream::{
    http::{HttpClient, HttpRequest, RequestBody},
    stream::source::BytesStream,
    PutAction,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

mod common;

/// Read until the end of the request head.
async fn read_head(server: &mut DuplexStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];

    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = server.read(&mut tmp).await.unwrap();
        assert!(n > 0, "request head ended prematurely");
        buf.extend_from_slice(&tmp[..n]);
    }

    String::from_utf8(buf).unwrap()
}

#[tokio::test]
async fn get_with_content_length() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let head = read_head(&mut server_io).await;
        assert!(head.starts_with("GET /index HTTP/1.1\r\n"));

        server_io
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        server_io
    });

    let client = HttpClient::new(client_io, lease)
        .with_stopwatch(Box::new(proxy_stream::lease::TracingStopwatch));
    let mut response = client
        .execute(HttpRequest::new(Method::GET, "/index"))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    let body = response.body.read_to_end().await.unwrap();
    assert_eq!(body, b"hello");

    assert_eq!(*actions.borrow(), [PutAction::Reuse]);
    server.await.unwrap();
}

#[tokio::test]
async fn chunked_response_round_trip() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let _ = read_head(&mut server_io).await;

        server_io
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
        server_io
    });

    let client = HttpClient::new(client_io, lease);
    let mut response = client
        .execute(HttpRequest::new(Method::GET, "/chunked"))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    // the transfer-encoding header is consumed by the client
    assert!(response.headers.get("transfer-encoding").is_none());

    let body = response.body.read_to_end().await.unwrap();
    assert_eq!(body, b"hello world");

    assert_eq!(*actions.borrow(), [PutAction::Reuse]);
    server.await.unwrap();
}

#[tokio::test]
async fn expect_100_continue_flow() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, actions, _returned) = common::RecordingLease::new();

    let body_bytes = vec![b'x'; 2048];
    let body_copy = body_bytes.clone();

    let server = tokio::spawn(async move {
        let head = read_head(&mut server_io).await;
        assert!(head.contains("expect: 100-continue\r\n"));
        assert!(head.contains("content-length: 2048\r\n"));

        // the body must be paused until we confirm
        assert!(head.ends_with("\r\n\r\n"));

        server_io
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();

        let mut received = vec![0u8; body_copy.len()];
        server_io.read_exact(&mut received).await.unwrap();
        assert_eq!(received, body_copy);
        server_io
    });

    let mut request = HttpRequest::new(Method::POST, "/upload");
    request.body = RequestBody::Plain(Box::new(BytesStream::new(body_bytes)));
    request.expect_100 = true;

    let client = HttpClient::new(client_io, lease);
    let mut response = client.execute(request).await.unwrap();

    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert_eq!(response.body.read_to_end().await.unwrap(), b"");

    assert_eq!(*actions.borrow(), [PutAction::Reuse]);
    server.await.unwrap();
}

#[tokio::test]
async fn small_body_is_sent_immediately() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, _actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let head = read_head(&mut server_io).await;
        assert!(!head.contains("expect:"));
        assert!(head.contains("content-length: 5\r\n"));

        let offset = head.find("\r\n\r\n").unwrap() + 4;
        let mut body = head.as_bytes()[offset..].to_vec();
        while body.len() < 5 {
            let mut tmp = [0u8; 64];
            let n = server_io.read(&mut tmp).await.unwrap();
            body.extend_from_slice(&tmp[..n]);
        }
        assert_eq!(body, b"small");

        server_io
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        server_io
    });

    let mut request = HttpRequest::new(Method::POST, "/small");
    request.body = RequestBody::Plain(Box::new(BytesStream::new(&b"small"[..])));
    request.expect_100 = true;

    let client = HttpClient::new(client_io, lease);
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);

    server.await.unwrap();
}

#[tokio::test]
async fn unknown_length_body_is_chunked() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, _actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let head = read_head(&mut server_io).await;
        assert!(head.contains("transfer-encoding: chunked\r\n"));

        let offset = head.find("\r\n\r\n").unwrap() + 4;
        let mut body = head.as_bytes()[offset..].to_vec();
        while !body.windows(5).any(|w| w == b"0\r\n\r\n") {
            let mut tmp = [0u8; 64];
            let n = server_io.read(&mut tmp).await.unwrap();
            body.extend_from_slice(&tmp[..n]);
        }
        assert!(body.starts_with(b"7\r\npayload\r\n"));

        server_io
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        server_io
    });

    /// A stream that hides its length.
    struct Opaque(BytesStream);

    impl proxy_stream::Stream for Opaque {
        fn available(&self, _partial: bool) -> Option<u64> {
            None
        }

        fn read(
            &mut self, handler: &mut dyn proxy_stream::StreamHandler,
        ) -> proxy_stream::stream::ReadResult {
            self.0.read(handler)
        }

        fn close(&mut self) {
            self.0.close();
        }
    }

    let mut request = HttpRequest::new(Method::POST, "/chunked-up");
    request.body =
        RequestBody::Plain(Box::new(Opaque(BytesStream::new(&b"payload"[..]))));

    let client = HttpClient::new(client_io, lease);
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);

    server.await.unwrap();
}

#[tokio::test]
async fn premature_close_in_body_is_premature_error() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let _ = read_head(&mut server_io).await;

        server_io
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n")
            .await
            .unwrap();
        server_io
            .write_all(&vec![b'y'; 40])
            .await
            .unwrap();
        // dropping the socket closes the connection prematurely
    });

    let client = HttpClient::new(client_io, lease);
    let mut response = client
        .execute(HttpRequest::new(Method::GET, "/broken"))
        .await
        .unwrap();

    let error = response.body.read_to_end().await.unwrap_err();
    assert_eq!(
        error.http_code(),
        Some(proxy_stream::HttpErrorCode::Premature)
    );
    assert!(error.is_retryable());

    assert_eq!(*actions.borrow(), [PutAction::Destroy]);
    server.await.unwrap();
}

#[tokio::test]
async fn refused_connection_is_retryable() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, _actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let _ = read_head(&mut server_io).await;
        // close without sending anything
    });

    let client = HttpClient::new(client_io, lease);
    let error = client
        .execute(HttpRequest::new(Method::GET, "/refused"))
        .await
        .unwrap_err();

    assert_eq!(
        error.http_code(),
        Some(proxy_stream::HttpErrorCode::Refused)
    );
    assert!(error.is_retryable());

    server.await.unwrap();
}

#[tokio::test]
async fn garbage_status_line() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, _actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let _ = read_head(&mut server_io).await;
        server_io.write_all(b"ICY 200 OK\r\n\r\n").await.unwrap();
        server_io
    });

    let client = HttpClient::new(client_io, lease);
    let error = client
        .execute(HttpRequest::new(Method::GET, "/garbage"))
        .await
        .unwrap_err();

    assert_eq!(
        error.http_code(),
        Some(proxy_stream::HttpErrorCode::Garbage)
    );

    server.await.unwrap();
}

#[tokio::test]
async fn connection_close_disables_reuse() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let _ = read_head(&mut server_io).await;
        server_io
            .write_all(
                b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok",
            )
            .await
            .unwrap();
        server_io
    });

    let client = HttpClient::new(client_io, lease);
    let mut response = client
        .execute(HttpRequest::new(Method::GET, "/close"))
        .await
        .unwrap();

    assert_eq!(response.body.read_to_end().await.unwrap(), b"ok");
    assert_eq!(*actions.borrow(), [PutAction::Destroy]);

    server.await.unwrap();
}

#[tokio::test]
async fn keep_alive_socket_serves_second_request() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, actions, returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        for payload in [&b"one"[..], &b"two"[..]] {
            let _ = read_head(&mut server_io).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                payload.len()
            );
            server_io.write_all(response.as_bytes()).await.unwrap();
            server_io.write_all(payload).await.unwrap();
        }
        server_io
    });

    let client = HttpClient::new(client_io, lease);
    let mut response = client
        .execute(HttpRequest::new(Method::GET, "/first"))
        .await
        .unwrap();
    assert_eq!(response.body.read_to_end().await.unwrap(), b"one");

    // the lease got the connection back; issue a second request on it
    let socket = returned.borrow_mut().take().unwrap();
    let (lease2, actions2, _returned2) = common::RecordingLease::new();

    let client = HttpClient::new(socket, lease2);
    let mut response = client
        .execute({
            let mut request = HttpRequest::new(Method::GET, "/second");
            request
                .headers
                .insert("x-probe", HeaderValue::from_static("1"));
            request
        })
        .await
        .unwrap();
    assert_eq!(response.body.read_to_end().await.unwrap(), b"two");

    assert_eq!(*actions.borrow(), [PutAction::Reuse]);
    assert_eq!(*actions2.borrow(), [PutAction::Reuse]);
    server.await.unwrap();
}
