//! End-to-end coverage of the zero-copy fast path over real sockets:
//! request bodies spliced from pipes into the connection, and response
//! bodies spliced from the connection into a pipe.

#![cfg(target_os = "linux")]

use http::{Method, StatusCode};
use proxy_stream::{
    http::{HttpClient, HttpRequest, RequestBody},
    stream::{
        pipe::{read_bytes, splice_bytes, write_bytes, AutoPipeStream, PipeLease,
               PipeLeaseStream, PipeStock},
        source::BytesStream,
        DataAction, DirectAction, FdKind, FdMask, ReadResult, Stream, StreamHandler,
    },
    Error, PutAction,
};
use std::{os::fd::BorrowedFd, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

mod common;

/// Read until the end of the request head; returns head and any body
/// bytes that came with it.
async fn read_head(socket: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];

    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8(buf[..pos + 4].to_vec()).unwrap();
            let body = buf[pos + 4..].to_vec();
            return (head, body);
        }

        let n = socket.read(&mut tmp).await.unwrap();
        assert!(n > 0, "request head ended prematurely");
        buf.extend_from_slice(&tmp[..n]);
    }
}

async fn read_exactly(socket: &mut TcpStream, mut body: Vec<u8>, total: usize) -> Vec<u8> {
    while body.len() < total {
        let mut tmp = [0u8; 1024];
        let n = socket.read(&mut tmp).await.unwrap();
        assert!(n > 0, "request body ended prematurely");
        body.extend_from_slice(&tmp[..n]);
    }
    body
}

#[tokio::test]
async fn pipe_lease_body_is_spliced_into_the_socket() {
    common::setup();

    let payload = b"pipe-fed request body";

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (head, body) = read_head(&mut socket).await;
        assert!(head.contains(&format!("content-length: {}\r\n", payload.len())));

        let body = read_exactly(&mut socket, body, payload.len()).await;
        assert_eq!(body, payload);

        socket
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
        socket
    });

    let stock = PipeStock::new();
    let lease = stock.lease().unwrap();
    let written = write_bytes(lease.write_fd(), payload).unwrap().unwrap();
    assert_eq!(written, payload.len());

    let mut request = HttpRequest::new(Method::POST, "/splice");
    request.body = RequestBody::Plain(Box::new(PipeLeaseStream::new(
        lease,
        payload.len() as u64,
    )));

    let connection = TcpStream::connect(addr).await.unwrap();
    let (lease, actions, _returned) = common::RecordingLease::new();
    let client = HttpClient::new(connection, lease);

    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert_eq!(*actions.borrow(), [PutAction::Reuse]);

    server.await.unwrap();
}

#[tokio::test]
async fn auto_pipe_body_is_spliced_into_the_socket() {
    common::setup();

    let payload = b"auto-piped body";

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (_, body) = read_head(&mut socket).await;
        let body = read_exactly(&mut socket, body, payload.len()).await;
        assert_eq!(body, payload);

        socket
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
        socket
    });

    let stock = PipeStock::new();
    let mut request = HttpRequest::new(Method::POST, "/auto-pipe");
    request.body = RequestBody::Plain(Box::new(AutoPipeStream::new(
        BytesStream::new(&payload[..]),
        stock,
    )));

    let connection = TcpStream::connect(addr).await.unwrap();
    let (lease, actions, _returned) = common::RecordingLease::new();
    let client = HttpClient::new(connection, lease);

    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert_eq!(*actions.borrow(), [PutAction::Reuse]);

    server.await.unwrap();
}

/// Splices the response body out of the socket into a pipe.
struct SpliceReceiver {
    out: PipeLease,
    eof: bool,
    error: Option<Error>,
}

impl StreamHandler for SpliceReceiver {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        // buffered fallback keeps the bytes flowing into the same pipe
        match write_bytes(self.out.write_fd(), data) {
            Ok(Some(n)) => DataAction::Consumed(n),
            _ => DataAction::Consumed(0),
        }
    }

    fn on_direct(
        &mut self, _kind: FdKind, fd: BorrowedFd<'_>, max: usize, _then_eof: bool,
    ) -> DirectAction {
        match splice_bytes(fd, self.out.write_fd(), max) {
            Ok(Some(0)) => DirectAction::End,
            Ok(Some(n)) => DirectAction::Consumed(n),
            Ok(None) => DirectAction::Empty,
            Err(error) => DirectAction::Failed(error),
        }
    }

    fn on_eof(&mut self) {
        self.eof = true;
    }

    fn on_error(&mut self, error: Error) {
        self.error = Some(error);
    }
}

#[tokio::test]
async fn response_body_is_spliced_out_of_the_socket() {
    common::setup();

    let payload = b"spliced response body";

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (release_body, body_gate) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = read_head(&mut socket).await;

        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
            payload.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();

        // hold the body back so it cannot land in the input buffer
        body_gate.await.unwrap();
        socket.write_all(payload).await.unwrap();
        socket
    });

    let connection = TcpStream::connect(addr).await.unwrap();
    let (lease, actions, _returned) = common::RecordingLease::new();
    let client = HttpClient::new(connection, lease);

    let mut response = client
        .execute(HttpRequest::new(Method::GET, "/direct"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);

    response.body.set_direct(FdMask::SOCKET);
    release_body.send(()).unwrap();

    let stock = PipeStock::new();
    let mut receiver = SpliceReceiver {
        out: stock.lease().unwrap(),
        eof: false,
        error: None,
    };

    loop {
        match response.body.read(&mut receiver) {
            ReadResult::Done => break,
            ReadResult::Pending => tokio::time::sleep(Duration::from_millis(2)).await,
            other => panic!("unexpected read result: {other:?}"),
        }
    }

    assert!(receiver.eof);
    assert!(receiver.error.is_none());

    let mut buf = [0u8; 256];
    let n = read_bytes(receiver.out.read_fd(), &mut buf).unwrap().unwrap();
    assert_eq!(&buf[..n], payload);

    assert_eq!(*actions.borrow(), [PutAction::Reuse]);
    server.await.unwrap();
}
