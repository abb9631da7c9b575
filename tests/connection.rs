mod support;

use h2client::{
    Bytes, Cancellation, CancellationSource, Connection, ConnectionInfo, Error, ErrorType, Method,
    Request, RequestBody, Url,
};
use maplit::hashmap;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use support::*;
use tokio::io::duplex;

fn url(input: &str) -> Url {
    Url::parse(input).expect("url")
}

async fn establish_with(settings: &[(u16, u32)]) -> (Connection, TestPeer) {
    let (client_io, server_io) = duplex(1 << 20);
    let connection = Connection::handshake(client_io, ConnectionInfo::default())
        .await
        .expect("handshake");
    let mut peer = TestPeer::new(server_io);
    peer.handshake(settings).await;
    (connection, peer)
}

async fn establish() -> (Connection, TestPeer) {
    establish_with(&[]).await
}

fn spawn_request(
    connection: &Connection,
    request: Request,
) -> tokio::task::JoinHandle<Result<h2client::Response, Error>> {
    let connection = connection.clone();
    tokio::spawn(async move { connection.request(request, Cancellation::none()).await })
}

#[tokio::test]
async fn headers_only_response_and_stream_reuse() {
    let (connection, mut peer) = establish().await;

    let mut request = Request::get(url("https://example.com/x"));
    request.headers = vec![
        ("X-Test".to_owned(), "1".to_owned()),
        ("Host".to_owned(), "stripped".to_owned()),
        ("Connection".to_owned(), "keep-alive".to_owned()),
    ];
    let task = spawn_request(&connection, request);

    let (stream_id, flags, _, headers) = peer.read_header_block().await;
    assert_eq!(stream_id, 1);
    assert_eq!(flags & FLAG_END_STREAM, FLAG_END_STREAM, "GET has no body");

    // Pseudo-headers lead, caller headers follow in order, host/connection gone.
    assert_eq!(headers[0].0, ":method");
    assert_eq!(headers[1].0, ":scheme");
    assert_eq!(headers[2].0, ":path");
    assert_eq!(headers[3].0, ":authority");
    let as_map: HashMap<String, String> = headers.iter().cloned().collect();
    assert_eq!(
        as_map,
        hashmap! {
            ":method".to_owned() => "GET".to_owned(),
            ":scheme".to_owned() => "https".to_owned(),
            ":path".to_owned() => "/x".to_owned(),
            ":authority".to_owned() => "example.com".to_owned(),
            "x-test".to_owned() => "1".to_owned(),
        }
    );

    peer.send_headers(stream_id, &[(":status", "204")], true).await;
    let response = task.await.expect("join").expect("response");
    assert_eq!(response.status(), 204);
    assert!(response.bytes().await.expect("body").is_empty());

    // The slot was released; the next exchange takes the next odd id.
    assert!(!connection.is_busy());
    let task = spawn_request(&connection, Request::get(url("https://example.com/y")));
    let (stream_id, _, _, _) = peer.read_header_block().await;
    assert_eq!(stream_id, 3);
    peer.send_headers(stream_id, &[(":status", "204")], true).await;
    assert_eq!(task.await.expect("join").expect("response").status(), 204);
}

#[tokio::test]
async fn request_waits_for_the_settings_exchange() {
    let (client_io, server_io) = duplex(1 << 20);
    let connection = Connection::handshake(client_io, ConnectionInfo::default())
        .await
        .expect("handshake");
    // Issued before the server spoke; must block on the settings signal and
    // must not let HEADERS overtake the SETTINGS ACK.
    let task = spawn_request(&connection, Request::get(url("https://example.com/")));

    let mut peer = TestPeer::new(server_io);
    peer.handshake(&[]).await;
    let (stream_id, _, _, _) = peer.read_header_block().await;
    assert_eq!(stream_id, 1);
    peer.send_headers(stream_id, &[(":status", "204")], true).await;
    assert_eq!(task.await.expect("join").expect("response").status(), 204);
}

#[tokio::test]
async fn chunked_body_with_window_replenishment() {
    let (connection, mut peer) = establish().await;
    let task = spawn_request(&connection, Request::get(url("https://example.com/big")));

    let (stream_id, _, _, _) = peer.read_header_block().await;
    peer.send_headers(stream_id, &[(":status", "200"), ("content-length", "65545")], false)
        .await;
    let response = task.await.expect("join").expect("response");
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("content-length"), Some("65545"));

    let mut expected = Vec::new();
    for index in 0..4_u8 {
        let chunk = vec![index + 1; 16_384];
        peer.send_data(stream_id, &chunk, false).await;
        expected.extend_from_slice(&chunk);
    }

    // First DATA pushes the connection window below half the body cap.
    let (update_stream, increment) = peer.expect_window_update().await;
    assert_eq!(update_stream, 0);
    assert_eq!(increment, (1 << 30) - 49_151);
    // The fourth DATA exhausts the stream window (65_536 > 65_535).
    let (update_stream, increment) = peer.expect_window_update().await;
    assert_eq!(update_stream, 1);
    assert_eq!(increment, (1 << 30) - 65_536);

    let tail = vec![9_u8; 9];
    peer.send_data(stream_id, &tail, true).await;
    expected.extend_from_slice(&tail);

    let body = response.bytes().await.expect("body");
    assert_eq!(body.len(), 65_545);
    assert_eq!(body.as_ref(), expected.as_slice());
    assert!(!connection.is_busy());
}

#[tokio::test]
async fn outbound_body_respects_the_peer_window() {
    // The peer grants 10 bytes of stream credit at a time.
    let (connection, mut peer) = establish_with(&[(0x4, 10)]).await;
    let request = Request::post(
        url("https://example.com/upload"),
        None,
        Bytes::from_static(b"abcdefghijklmnopqrstuvwxy"),
    );
    let task = spawn_request(&connection, request);

    let (stream_id, flags, _, headers) = peer.read_header_block().await;
    assert_eq!(flags & FLAG_END_STREAM, 0, "body follows");
    assert!(headers.contains(&("content-length".to_owned(), "25".to_owned())));

    let (data, end_stream) = peer.expect_data(stream_id).await;
    assert_eq!(data, b"abcdefghij");
    assert!(!end_stream);

    peer.send_window_update(stream_id, 10).await;
    let (data, end_stream) = peer.expect_data(stream_id).await;
    assert_eq!(data, b"klmnopqrst");
    assert!(!end_stream);

    peer.send_window_update(stream_id, 10).await;
    let (data, end_stream) = peer.expect_data(stream_id).await;
    assert_eq!(data, b"uvwxy");
    assert!(end_stream, "END_STREAM rides the final fragment");

    peer.send_headers(stream_id, &[(":status", "204")], true).await;
    assert_eq!(task.await.expect("join").expect("response").status(), 204);
}

#[tokio::test]
async fn oversized_request_headers_split_into_continuation() {
    let (connection, mut peer) = establish().await;
    let mut request = Request::get(url("https://example.com/"));
    request
        .headers
        .push(("x-large".to_owned(), "ab".repeat(20_000)));
    let task = spawn_request(&connection, request);

    let (stream_id, flags, frames, headers) = peer.read_header_block().await;
    assert_eq!(
        flags & FLAG_END_HEADERS,
        0,
        "initial HEADERS must defer END_HEADERS to the continuation"
    );
    assert!(frames >= 2, "block spans HEADERS plus CONTINUATION");
    assert!(headers.contains(&("x-large".to_owned(), "ab".repeat(20_000))));

    peer.send_headers(stream_id, &[(":status", "204")], true).await;
    assert_eq!(task.await.expect("join").expect("response").status(), 204);
}

#[tokio::test]
async fn peer_reset_fails_only_its_own_stream() {
    let (connection, mut peer) = establish().await;

    let first = spawn_request(&connection, Request::get(url("https://example.com/a")));
    let (first_id, _, _, _) = peer.read_header_block().await;
    assert_eq!(first_id, 1);
    peer.send_headers(first_id, &[(":status", "200")], false).await;
    let response = first.await.expect("join").expect("response");
    peer.send_data(first_id, b"partial", false).await;

    let second = spawn_request(&connection, Request::get(url("https://example.com/b")));
    let (second_id, _, _, _) = peer.read_header_block().await;
    assert_eq!(second_id, 3);
    peer.send_headers(second_id, &[(":status", "200"), ("content-length", "2")], false)
        .await;
    peer.send_data(second_id, b"ok", true).await;
    let other = second.await.expect("join").expect("response");
    assert_eq!(other.bytes().await.expect("body").as_ref(), b"ok");

    peer.send_rst(first_id, 0x7).await;
    let mut body = response.into_body();
    assert_eq!(
        body.chunk().await.expect("chunk").expect("bytes").as_ref(),
        b"partial"
    );
    assert!(matches!(
        body.chunk().await.expect("chunk"),
        Err(Error::ServerReset {
            code: ErrorType::RefusedStream
        })
    ));
    assert!(body.chunk().await.is_none());

    // The connection survives a stream reset.
    assert!(!connection.is_busy());
}

#[tokio::test]
async fn goaway_marks_unprocessed_streams_retryable() {
    let (connection, mut peer) = establish().await;

    let first = spawn_request(&connection, Request::get(url("https://example.com/a")));
    let (first_id, _, _, _) = peer.read_header_block().await;
    let second = spawn_request(&connection, Request::get(url("https://example.com/b")));
    let (second_id, _, _, _) = peer.read_header_block().await;
    assert_eq!((first_id, second_id), (1, 3));

    peer.send_goaway(first_id, 0x0).await;

    let first_err = first.await.expect("join").expect_err("first fails");
    assert!(
        matches!(
            first_err,
            Error::GoneAway {
                last_stream_id: 1,
                retryable: false,
                ..
            }
        ),
        "the server may have processed stream 1: {first_err:?}"
    );
    assert!(!first_err.is_retryable());

    let second_err = second.await.expect("join").expect_err("second fails");
    assert!(matches!(
        second_err,
        Error::GoneAway {
            last_stream_id: 1,
            code: ErrorType::NoError,
            retryable: true,
        }
    ));
    assert!(second_err.is_retryable());

    assert!(connection.is_busy());
}

#[tokio::test]
async fn cancellation_resets_the_stream_and_restores_the_budget() {
    let (connection, mut peer) = establish().await;

    let (body_tx, body_rx) = tokio::sync::mpsc::channel(4);
    let request = Request::new(
        Method::Post,
        url("https://example.com/stream"),
        None,
        RequestBody::Streaming(body_rx),
    );
    let source = CancellationSource::new();
    let token = source.token();
    let connection_clone = connection.clone();
    let task =
        tokio::spawn(async move { connection_clone.request(request, token).await });

    body_tx.send(Bytes::from_static(b"first")).await.expect("send");
    body_tx.send(Bytes::from_static(b"second")).await.expect("send");

    let (stream_id, flags, _, _) = peer.read_header_block().await;
    assert_eq!(flags & FLAG_END_STREAM, 0);
    let (data, end_stream) = peer.expect_data(stream_id).await;
    assert_eq!(data, b"first");
    assert!(!end_stream);

    source.cancel();
    assert_eq!(peer.expect_rst(stream_id).await, 0x8, "RST_STREAM(CANCEL)");
    assert!(matches!(
        task.await.expect("join"),
        Err(Error::Cancelled)
    ));

    // The slot is free again and ids keep growing.
    let task = spawn_request(&connection, Request::get(url("https://example.com/next")));
    let (stream_id, _, _, _) = peer.read_header_block().await;
    assert_eq!(stream_id, 3);
    peer.send_headers(stream_id, &[(":status", "204")], true).await;
    assert_eq!(task.await.expect("join").expect("response").status(), 204);
}

#[tokio::test]
async fn push_promise_is_a_connection_error() {
    let (connection, mut peer) = establish().await;
    let task = spawn_request(&connection, Request::get(url("https://example.com/")));
    let (stream_id, _, _, _) = peer.read_header_block().await;

    peer.write_frame(TYPE_PUSH_PROMISE, FLAG_END_HEADERS, stream_id, &2_u32.to_be_bytes())
        .await;

    assert_eq!(peer.expect_goaway().await, 0x1, "PROTOCOL_ERROR");
    assert!(matches!(
        task.await.expect("join"),
        Err(Error::Connection {
            code: ErrorType::ProtocolError,
            ..
        })
    ));
    assert!(connection.is_busy());
}

#[tokio::test]
async fn data_on_an_unknown_stream_poisons_the_connection() {
    let (_connection, mut peer) = establish().await;
    peer.send_data(9, b"stray", false).await;
    assert_eq!(peer.expect_goaway().await, 0x1, "PROTOCOL_ERROR");
}

#[tokio::test]
async fn zero_window_increment_is_a_protocol_error() {
    let (_connection, mut peer) = establish().await;
    peer.send_window_update(0, 0).await;
    assert_eq!(peer.expect_goaway().await, 0x1, "PROTOCOL_ERROR");
}

#[tokio::test]
async fn close_fires_callbacks_exactly_once_in_order() {
    let (connection, mut peer) = establish().await;

    let fired = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    for index in 0..2 {
        let fired = fired.clone();
        let order = order.clone();
        connection.on_close(move || {
            fired.fetch_add(1, Ordering::SeqCst);
            order.lock().expect("order").push(index);
        });
    }

    connection.close().await;
    connection.close().await;
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert_eq!(*order.lock().expect("order"), vec![0, 1]);
    assert_eq!(peer.expect_goaway().await, 0x0, "graceful shutdown");

    // Late registration fires immediately.
    let fired_late = fired.clone();
    connection.on_close(move || {
        fired_late.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fired.load(Ordering::SeqCst), 3);
    assert!(connection.is_busy());
}
