use http::{Method, StatusCode};
use proxy_stream::{
    fcgi::{FcgiClient, FcgiRequest, RecordHeader, RecordType},
    Error, PutAction,
};
use std::{
    io::Write,
    sync::{Arc, Mutex},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

mod common;

/// Read the request until the empty STDIN terminator record; returns the
/// raw request bytes and the request id.
async fn read_request(server: &mut DuplexStream) -> (Vec<u8>, u16) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];

    loop {
        let n = server.read(&mut tmp).await.unwrap();
        assert!(n > 0, "request ended prematurely");
        buf.extend_from_slice(&tmp[..n]);

        if buf.len() >= 8 {
            let tail: [u8; 8] = buf[buf.len() - 8..].try_into().unwrap();
            let header = RecordHeader::parse(&tail);
            if header.record_type == RecordType::Stdin && header.content_length == 0 {
                break;
            }
        }
    }

    let id = u16::from_be_bytes([buf[2], buf[3]]);
    (buf, id)
}

fn record(record_type: RecordType, id: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(
        &RecordHeader::new(record_type, id, payload.len() as u16).encode(),
    );
    out.extend_from_slice(payload);
    out
}

fn end_request(id: u16) -> Vec<u8> {
    record(RecordType::EndRequest, id, &[0, 0, 0, 0, 0, 0, 0, 0])
}

#[tokio::test]
async fn echo_get_with_keep_alive_reuse() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let (request, id) = read_request(&mut server_io).await;

        // BEGIN_REQUEST must announce the responder role with KEEP_CONN
        let header = RecordHeader::parse(&request[..8].try_into().unwrap());
        assert_eq!(header.record_type, RecordType::BeginRequest);
        assert_eq!(&request[8..11], &[0, 1, 1]);

        let request_text = String::from_utf8_lossy(&request).into_owned();
        assert!(request_text.contains("REQUEST_METHOD"));
        assert!(request_text.contains("GET"));
        assert!(request_text.contains("/t"));

        let mut response = Vec::new();
        response.extend_from_slice(&record(
            RecordType::Stdout,
            id,
            b"Status: 200\r\nContent-Length: 3\r\n\r\nfoo",
        ));
        response.extend_from_slice(&end_request(id));
        server_io.write_all(&response).await.unwrap();
        server_io
    });

    let client = FcgiClient::new(client_io, lease);
    let mut response = client
        .execute(FcgiRequest::new(Method::GET, "/t"))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers["content-length"], "3");

    let body = response.body.read_to_end().await.unwrap();
    assert_eq!(body, b"foo");

    assert_eq!(*actions.borrow(), [PutAction::Reuse]);
    server.await.unwrap();
}

#[tokio::test]
async fn post_body_is_framed_into_stdin_records() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, _actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let (request, id) = read_request(&mut server_io).await;

        // find the STDIN payload
        let mut stdin_payload = Vec::new();
        let mut pos = 0;
        while pos + 8 <= request.len() {
            let header = RecordHeader::parse(&request[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let len = header.content_length as usize;
            if header.record_type == RecordType::Stdin {
                stdin_payload.extend_from_slice(&request[pos..pos + len]);
            }
            pos += len + header.padding_length as usize;
        }
        assert_eq!(stdin_payload, b"p1=3&p2=4");

        let mut response = Vec::new();
        response.extend_from_slice(&record(
            RecordType::Stdout,
            id,
            b"Status: 204\r\n\r\n",
        ));
        response.extend_from_slice(&end_request(id));
        server_io.write_all(&response).await.unwrap();
        server_io
    });

    let mut request = FcgiRequest::new(Method::POST, "/post");
    request.body = Some(Box::new(proxy_stream::stream::source::BytesStream::new(
        &b"p1=3&p2=4"[..],
    )));

    let client = FcgiClient::new(client_io, lease);
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status, StatusCode::NO_CONTENT);

    server.await.unwrap();
}

/// A `Write` sink capturing STDERR output.
#[derive(Clone, Default)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn stderr_is_diverted_from_the_body() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, _actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let (_, id) = read_request(&mut server_io).await;

        let mut response = Vec::new();
        response.extend_from_slice(&record(
            RecordType::Stdout,
            id,
            b"Status: 200\r\nContent-Length: 6\r\n\r\nfirst-",
        ));
        response.extend_from_slice(&record(RecordType::Stderr, id, b"PHP warning"));
        response.extend_from_slice(&end_request(id));
        server_io.write_all(&response).await.unwrap();
        server_io
    });

    let stderr = SharedWriter::default();
    let client =
        FcgiClient::new(client_io, lease).with_stderr(Box::new(stderr.clone()));
    let mut response = client
        .execute(FcgiRequest::new(Method::GET, "/err"))
        .await
        .unwrap();

    let body = response.body.read_to_end().await.unwrap();
    assert_eq!(body, b"first-");
    assert_eq!(&*stderr.0.lock().unwrap(), b"PHP warning");

    server.await.unwrap();
}

#[tokio::test]
async fn records_of_other_requests_are_skipped() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, _actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let (_, id) = read_request(&mut server_io).await;

        let mut response = Vec::new();
        // a record of a foreign request id must be ignored wholesale
        response.extend_from_slice(&record(
            RecordType::Stdout,
            id.wrapping_add(1),
            b"Status: 500\r\n\r\nnothing to see",
        ));
        response.extend_from_slice(&record(
            RecordType::Stdout,
            id,
            b"Status: 200\r\nContent-Length: 2\r\n\r\nok",
        ));
        response.extend_from_slice(&end_request(id));
        server_io.write_all(&response).await.unwrap();
        server_io
    });

    let client = FcgiClient::new(client_io, lease);
    let mut response = client
        .execute(FcgiRequest::new(Method::GET, "/skip"))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.read_to_end().await.unwrap(), b"ok");

    server.await.unwrap();
}

#[tokio::test]
async fn premature_close_is_retryable() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let (_, id) = read_request(&mut server_io).await;

        let mut response = Vec::new();
        response.extend_from_slice(&record(
            RecordType::Stdout,
            id,
            b"Status: 200\r\nContent-Length: 100\r\n\r\npartial",
        ));
        server_io.write_all(&response).await.unwrap();
        // dropping the socket closes the connection prematurely
    });

    let client = FcgiClient::new(client_io, lease);
    let mut response = client
        .execute(FcgiRequest::new(Method::GET, "/broken"))
        .await
        .unwrap();

    let error = response.body.read_to_end().await.unwrap_err();
    assert!(matches!(error, Error::ClosedPrematurely));
    assert!(error.is_retryable());
    assert_eq!(*actions.borrow(), [PutAction::Destroy]);

    server.await.unwrap();
}

#[tokio::test]
async fn head_request_has_no_body() {
    common::setup();

    let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
    let (lease, _actions, _returned) = common::RecordingLease::new();

    let server = tokio::spawn(async move {
        let (_, id) = read_request(&mut server_io).await;

        let mut response = Vec::new();
        response.extend_from_slice(&record(
            RecordType::Stdout,
            id,
            b"Status: 200\r\nContent-Length: 42\r\n\r\nthis payload must be ignored",
        ));
        response.extend_from_slice(&end_request(id));
        server_io.write_all(&response).await.unwrap();
        server_io
    });

    let client = FcgiClient::new(client_io, lease);
    let mut response = client
        .execute(FcgiRequest::new(Method::HEAD, "/head"))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers["content-length"], "42");
    assert_eq!(response.body.read_to_end().await.unwrap(), b"");

    server.await.unwrap();
}
