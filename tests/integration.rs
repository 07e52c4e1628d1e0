//! End-to-end tests for message sessions over in-memory duplex streams.

use std::time::Duration;

use bytes::Bytes;
use framewire::codec::MsgPackCodec;
use framewire::protocol::{encode_frame, MessageHeader};
use framewire::{
    message_type, CloseReason, FaultOrigin, FramewireError, MessageClient, MessageServer,
    TransportBuilder,
};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const STEP: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Message1 {
    data: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Message2 {
    data: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Blob {
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Rejected {
    reason: String,
}

message_type! {
    Message1 => "Message1",
    Message2 => "Message2",
    Blob => "Blob",
    Rejected => "Rejected",
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open_pair(client: TransportBuilder, server: TransportBuilder) -> (MessageClient, MessageServer) {
    init_tracing();
    let token = CancellationToken::new();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = client.client(a, token.clone());
    let server = server.server(b, token);
    client.open().unwrap();
    server.open().unwrap();
    (client, server)
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let (client, server) = open_pair(TransportBuilder::new(), TransportBuilder::new());

    let request = client.send_data(&Message1 { data: 5 }).await.unwrap();

    let received = timeout(STEP, server.receive_data::<Message1>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.payload(), &Message1 { data: 5 });
    assert_eq!(received.request_id(), request.request_id());
    assert!(received.is_remote());

    received
        .respond(&Message2 {
            data: received.payload().data,
        })
        .await
        .unwrap();

    let reply = timeout(STEP, request.receive_data::<Message2>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.payload(), &Message2 { data: 5 });
    assert_eq!(reply.request_id(), received.request_id());
    assert!(reply.is_response());

    assert!(client.is_connection_open());
    assert!(server.is_connection_open());
}

#[tokio::test]
async fn test_hundred_round_trips_with_tiny_frames() {
    let (client, server) = open_pair(
        TransportBuilder::new().max_frame_size(12),
        TransportBuilder::new().max_frame_size(12),
    );

    let responder = tokio::spawn(async move {
        for _ in 0..100 {
            let request = server.receive_data::<Message1>().await.unwrap();
            let data = request.payload().data;
            request.respond(&Message2 { data }).await.unwrap();
        }
        server
    });

    let mut requests = Vec::new();
    for i in 0..100 {
        let request = client.send_data(&Message1 { data: i * 1000 }).await.unwrap();
        requests.push((i * 1000, request));
    }

    for (expected, request) in requests {
        let id = request.request_id();
        let reply = timeout(STEP, request.receive_data::<Message2>())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.payload().data, expected);
        assert_eq!(reply.request_id(), id);
    }

    let server = timeout(STEP, responder).await.unwrap().unwrap();
    assert!(server.is_connection_open());
}

#[tokio::test]
async fn test_both_directions_concurrently() {
    let (client, server) = open_pair(TransportBuilder::new(), TransportBuilder::new());

    let to_server = client.send_data(&Message1 { data: 1 }).await.unwrap();
    let to_client = server.send_data(&Message1 { data: 2 }).await.unwrap();

    let at_server = server.receive_data::<Message1>().await.unwrap();
    let at_client = client.receive_data::<Message1>().await.unwrap();
    assert_eq!(at_server.payload().data, 1);
    assert_eq!(at_client.payload().data, 2);

    at_server.respond(&Message2 { data: 10 }).await.unwrap();
    at_client.respond(&Message2 { data: 20 }).await.unwrap();

    let reply = to_server.receive_data::<Message2>().await.unwrap();
    assert_eq!(reply.payload().data, 10);
    let reply = to_client.receive_data::<Message2>().await.unwrap();
    assert_eq!(reply.payload().data, 20);
}

#[tokio::test]
async fn test_requests_are_routed_by_type() {
    let (client, server) = open_pair(TransportBuilder::new(), TransportBuilder::new());

    let _first = client.send_data(&Message1 { data: 1 }).await.unwrap();
    let _second = client
        .send_data(&Blob {
            data: vec![1, 2, 3],
        })
        .await
        .unwrap();

    let blob = timeout(STEP, server.receive_data::<Blob>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blob.payload().data, vec![1, 2, 3]);

    let message = timeout(STEP, server.receive_data::<Message1>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.payload().data, 1);
}

#[tokio::test]
async fn test_fault_reaches_both_sides() {
    let (client, server) = open_pair(TransportBuilder::new(), TransportBuilder::new());

    let request = client.send_data(&Message1 { data: 13 }).await.unwrap();
    let received = server.receive_data::<Message1>().await.unwrap();

    let exception = received
        .fault(Rejected {
            reason: "unlucky".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(exception.request_id, request.request_id());
    assert_eq!(exception.fault.reason, "unlucky");

    let err = timeout(STEP, request.receive_data::<Message2>())
        .await
        .unwrap()
        .unwrap_err();
    let FramewireError::Fault(remote) = err else {
        panic!("expected fault, got {err:?}");
    };
    assert_eq!(remote.origin(), FaultOrigin::Remote);
    assert_eq!(remote.decode::<Rejected>().unwrap().reason, "unlucky");

    let client_fault = timeout(STEP, client.on_fault()).await.unwrap().unwrap();
    let server_fault = timeout(STEP, server.on_fault()).await.unwrap().unwrap();
    assert_eq!(client_fault, server_fault);
    assert_eq!(server_fault.origin(), FaultOrigin::Local);

    timeout(STEP, client.wait_closed()).await.unwrap();
    timeout(STEP, server.wait_closed()).await.unwrap();
    assert_eq!(client.close_reason(), Some(CloseReason::Faulted));
    assert_eq!(server.close_reason(), Some(CloseReason::Faulted));

    assert!(matches!(
        client.send_data(&Message1 { data: 1 }).await,
        Err(FramewireError::Cancelled)
    ));
}

#[tokio::test]
async fn test_fault_is_written_after_earlier_replies() {
    let (client, server) = open_pair(TransportBuilder::new(), TransportBuilder::new());

    let first = client.send_data(&Message1 { data: 1 }).await.unwrap();
    let second = client.send_data(&Message1 { data: 2 }).await.unwrap();

    let a = server.receive_data::<Message1>().await.unwrap();
    let b = server.receive_data::<Message1>().await.unwrap();
    a.respond(&Message2 { data: 1 }).await.unwrap();
    b.fault(Rejected {
        reason: "second".to_string(),
    })
    .await
    .unwrap();

    let reply = timeout(STEP, first.receive_data::<Message2>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.payload().data, 1);
    assert!(matches!(
        timeout(STEP, second.receive_data::<Message2>()).await.unwrap(),
        Err(FramewireError::Fault(_))
    ));
}

#[tokio::test]
async fn test_oversized_request_is_rejected_for_its_type_only() {
    let (client, server) = open_pair(
        TransportBuilder::new(),
        TransportBuilder::new().response_buffer_size(64),
    );

    let _big = client.send_data(&Blob { data: vec![7; 100] }).await.unwrap();
    let err = timeout(STEP, server.receive_data::<Blob>())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        FramewireError::BufferTooSmall { capacity: 64, .. }
    ));

    let _small = client.send_data(&Blob { data: vec![7; 4] }).await.unwrap();
    let blob = timeout(STEP, server.receive_data::<Blob>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blob.payload().data, vec![7; 4]);
    assert!(server.is_connection_open());
}

#[tokio::test]
async fn test_full_response_buffer_pauses_reading() {
    let (client, server) = open_pair(
        TransportBuilder::new(),
        TransportBuilder::new().response_buffer_size(40),
    );

    // each blob encodes to 28 bytes, so the second one has to wait
    let _b1 = client.send_data(&Blob { data: vec![1; 20] }).await.unwrap();
    let _b2 = client.send_data(&Blob { data: vec![2; 20] }).await.unwrap();
    let _m = client.send_data(&Message1 { data: 3 }).await.unwrap();

    let wait = CancellationToken::new();
    let cancel = wait.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    assert!(matches!(
        server.receive_data_with::<Message1>(&wait).await,
        Err(FramewireError::Cancelled)
    ));
    assert!(server.is_connection_open());

    let first = server.receive_data::<Blob>().await.unwrap();
    assert_eq!(first.payload().data, vec![1; 20]);
    let second = timeout(STEP, server.receive_data::<Blob>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.payload().data, vec![2; 20]);
    let message = timeout(STEP, server.receive_data::<Message1>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.payload().data, 3);
}

#[tokio::test]
async fn test_message_larger_than_frame_is_fatal() {
    let (client, _server) = open_pair(
        TransportBuilder::new().max_frame_size(12),
        TransportBuilder::new(),
    );

    let err = client
        .send_data(&Blob { data: vec![0; 50] })
        .await
        .unwrap_err();
    assert!(matches!(err, FramewireError::FrameOverflow { max: 12, .. }));

    timeout(STEP, client.wait_closed()).await.unwrap();
    assert_eq!(client.close_reason(), Some(CloseReason::ProtocolViolation));
}

#[tokio::test]
async fn test_cancel_token_closes_session() {
    init_tracing();
    let client_token = CancellationToken::new();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = MessageClient::new(a, client_token.clone());
    let server = MessageServer::new(b, CancellationToken::new());
    client.open().unwrap();
    server.open().unwrap();

    let pending = client.send_data(&Message1 { data: 1 }).await.unwrap();
    let waiting = tokio::spawn({
        let token = CancellationToken::new();
        async move {
            let result = server.receive_data_with::<Message2>(&token).await;
            (server, result)
        }
    });

    client_token.cancel();

    assert!(matches!(
        timeout(STEP, pending.receive_data::<Message2>()).await.unwrap(),
        Err(FramewireError::Cancelled)
    ));
    timeout(STEP, client.wait_closed()).await.unwrap();
    assert!(!client.is_connection_open());
    assert_eq!(client.close_reason(), Some(CloseReason::Cancelled));

    let (server, result) = timeout(STEP, waiting).await.unwrap().unwrap();
    assert!(matches!(result, Err(FramewireError::ConnectionClosed)));
    timeout(STEP, server.wait_closed()).await.unwrap();
    assert_eq!(server.close_reason(), Some(CloseReason::ConnectionClosed));
}

#[tokio::test]
async fn test_abandoned_reply_is_discarded() {
    let (client, server) = open_pair(TransportBuilder::new(), TransportBuilder::new());

    let abandoned = client.send_data(&Message1 { data: 1 }).await.unwrap();
    drop(abandoned);

    let request = server.receive_data::<Message1>().await.unwrap();
    request.respond(&Message2 { data: 1 }).await.unwrap();

    // the session survives a reply nobody waits for
    let next = client.send_data(&Message1 { data: 2 }).await.unwrap();
    let request = server.receive_data::<Message1>().await.unwrap();
    request.respond(&Message2 { data: 2 }).await.unwrap();
    let reply = timeout(STEP, next.receive_data::<Message2>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.payload().data, 2);
    assert!(client.is_connection_open());
}

#[tokio::test]
async fn test_request_is_answered_once() {
    let (client, server) = open_pair(TransportBuilder::new(), TransportBuilder::new());

    let request = client.send_data(&Message1 { data: 4 }).await.unwrap();
    let received = timeout(STEP, server.receive_data::<Message1>())
        .await
        .unwrap()
        .unwrap();
    let copy = received.result().clone();

    received.respond(&Message2 { data: 4 }).await.unwrap();
    assert!(copy.is_answered());
    assert!(matches!(
        received.respond(&Message2 { data: 5 }).await,
        Err(FramewireError::Protocol(_))
    ));
    assert!(matches!(
        copy.fault(Rejected {
            reason: "too late".to_string(),
        })
        .await,
        Err(FramewireError::Protocol(_))
    ));

    let reply = timeout(STEP, request.receive_data::<Message2>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.payload().data, 4);

    // the peer never saw a second reply
    let next = client.send_data(&Message1 { data: 6 }).await.unwrap();
    let received = server.receive_data::<Message1>().await.unwrap();
    received.respond(&Message2 { data: 6 }).await.unwrap();
    assert_eq!(
        timeout(STEP, next.receive_data::<Message2>())
            .await
            .unwrap()
            .unwrap()
            .payload()
            .data,
        6
    );
    assert!(client.is_connection_open());
    assert!(server.is_connection_open());
}

#[tokio::test]
async fn test_reply_after_caller_gave_up_is_discarded() {
    let (client, server) = open_pair(TransportBuilder::new(), TransportBuilder::new());

    let request = client.send_data(&Message1 { data: 1 }).await.unwrap();
    let gave_up = CancellationToken::new();
    gave_up.cancel();
    assert!(matches!(
        request.receive_data_with::<Message2>(&gave_up).await,
        Err(FramewireError::Cancelled)
    ));

    let late = server.receive_data::<Message1>().await.unwrap();
    late.respond(&Message2 { data: 1 }).await.unwrap();

    let next = client.send_data(&Message1 { data: 2 }).await.unwrap();
    let request = server.receive_data::<Message1>().await.unwrap();
    request.respond(&Message2 { data: 2 }).await.unwrap();
    let reply = timeout(STEP, next.receive_data::<Message2>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.payload().data, 2);
    assert!(client.is_connection_open());
}

#[tokio::test]
async fn test_paced_client_still_delivers() {
    let (client, server) = open_pair(
        TransportBuilder::new()
            .min_delay(Duration::from_millis(2))
            .max_frame_size(32),
        TransportBuilder::new(),
    );
    assert_eq!(client.min_delay(), Duration::from_millis(2));
    assert_eq!(client.max_frame_size(), 32);

    let mut requests = Vec::new();
    for i in 0..10 {
        requests.push(client.send_data(&Message1 { data: i }).await.unwrap());
    }
    for i in 0..10 {
        let request = timeout(STEP, server.receive_data::<Message1>())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.payload().data, i);
    }
}

/// A session whose peer is a raw byte stream driven by the test.
fn open_with_raw_peer() -> (MessageClient, tokio::io::DuplexStream) {
    init_tracing();
    let (a, raw) = tokio::io::duplex(64 * 1024);
    let client = MessageClient::new(a, CancellationToken::new());
    client.open().unwrap();
    (client, raw)
}

async fn write_raw_frame(raw: &mut tokio::io::DuplexStream, header: MessageHeader, payload: Vec<u8>) {
    use tokio::io::AsyncWriteExt;

    let frame = encode_frame(&[(header, Bytes::from(payload))]).unwrap();
    raw.write_all(&frame).await.unwrap();
}

#[tokio::test]
async fn test_reply_to_unknown_request_is_fatal() {
    let (client, mut raw) = open_with_raw_peer();
    let pending = client.send_data(&Message1 { data: 1 }).await.unwrap();

    let stray = MessageHeader {
        request_id: pending.request_id() + 100,
        is_response: true,
        data_type: "Message2".to_string(),
        ..Default::default()
    };
    write_raw_frame(&mut raw, stray, MsgPackCodec::encode(&Message2 { data: 1 }).unwrap()).await;

    timeout(STEP, client.wait_closed()).await.unwrap();
    assert_eq!(client.close_reason(), Some(CloseReason::ProtocolViolation));
    assert!(matches!(
        timeout(STEP, pending.receive_data::<Message2>()).await.unwrap(),
        Err(FramewireError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_faulted_request_is_fatal() {
    let (client, mut raw) = open_with_raw_peer();
    let pending = client.send_data(&Message1 { data: 1 }).await.unwrap();

    let bogus = MessageHeader {
        request_id: 42,
        faulted: true,
        is_response: false,
        data_type: "Rejected".to_string(),
        ..Default::default()
    };
    let payload = MsgPackCodec::encode(&Rejected {
        reason: "not a reply".to_string(),
    })
    .unwrap();
    write_raw_frame(&mut raw, bogus, payload).await;

    timeout(STEP, client.wait_closed()).await.unwrap();
    assert_eq!(client.close_reason(), Some(CloseReason::ProtocolViolation));
    assert!(matches!(
        timeout(STEP, pending.receive_data::<Message2>()).await.unwrap(),
        Err(FramewireError::ConnectionClosed)
    ));
    assert!(matches!(
        client.receive_data::<Message1>().await,
        Err(FramewireError::ConnectionClosed)
    ));
    // no fault is published for a malformed one
    assert!(matches!(client.on_fault().await, Err(FramewireError::Cancelled)));
}
