//! Tests for the stream multiplexer over in-memory duplex streams.

use std::time::Duration;

use framewire::{
    message_type, CloseReason, FramewireError, MessageClient, MessageServer, MultiplexConfig,
    MultiplexedStreamFactory,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const STEP: Duration = Duration::from_secs(5);

fn factory_pair(config: MultiplexConfig) -> (MultiplexedStreamFactory, MultiplexedStreamFactory) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let left = MultiplexedStreamFactory::with_config(a, CancellationToken::new(), config.clone());
    let right = MultiplexedStreamFactory::with_config(b, CancellationToken::new(), config);
    left.open().unwrap();
    right.open().unwrap();
    (left, right)
}

#[tokio::test]
async fn test_channels_are_independent() {
    let (left, right) = factory_pair(MultiplexConfig::default());

    let l1 = left.create_channel(1);
    let l2 = left.create_channel(2);
    let r1 = right.create_channel(1);
    let r2 = right.create_channel(2);

    l1.write_all(b"hello").await.unwrap();
    l2.write_all(b"world!").await.unwrap();
    l1.write_all(b" again").await.unwrap();

    let mut buf = [0u8; 6];
    timeout(STEP, r2.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"world!");

    let mut buf = [0u8; 11];
    timeout(STEP, r1.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello again");
    assert_eq!(r1.buffered(), 0);
}

#[tokio::test]
async fn test_read_exact_waits_for_all_bytes() {
    let (left, right) = factory_pair(MultiplexConfig::default());
    let writer = left.create_channel(3);
    let reader = right.create_channel(3);

    let read = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).await.map(|()| buf)
    });

    writer.write_all(b"abcd").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!read.is_finished());

    writer.write_all(b"efgh").await.unwrap();
    let buf = timeout(STEP, read).await.unwrap().unwrap().unwrap();
    assert_eq!(&buf, b"abcdefgh");
}

#[tokio::test]
async fn test_unknown_channel_is_created_on_arrival() {
    let (left, right) = factory_pair(MultiplexConfig::default());

    left.create_channel(42).write_all(b"early").await.unwrap();

    // wait until the chunk has been demultiplexed
    timeout(STEP, async {
        while right.channel_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let late = right.create_channel(42);
    let mut buf = [0u8; 5];
    timeout(STEP, late.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"early");
    assert_eq!(right.channel_count(), 1);
}

#[tokio::test]
async fn test_chunks_larger_than_read_buffer() {
    let (left, right) = factory_pair(MultiplexConfig {
        read_buffer_size: 16,
        ..MultiplexConfig::default()
    });
    assert_eq!(right.read_buffer_size(), 16);

    let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    left.create_channel(0).write_all(&data).await.unwrap();

    let mut buf = vec![0u8; data.len()];
    timeout(STEP, right.create_channel(0).read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, data);
}

#[tokio::test]
async fn test_full_channel_pauses_reading() {
    let (left, right) = factory_pair(MultiplexConfig {
        read_buffer_size: 8,
        channel_buffer_size: 16,
        ..MultiplexConfig::default()
    });

    let data: Vec<u8> = (0..64u8).collect();
    left.create_channel(1).write_all(&data).await.unwrap();
    left.create_channel(2).write_all(b"next").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let busy = right.create_channel(1);
    let behind = right.create_channel(2);
    assert!(busy.buffered() < 16 + 8, "buffered {}", busy.buffered());
    assert_eq!(behind.buffered(), 0, "reading stays paused behind a full channel");

    // a read larger than the cap still completes
    let mut buf = vec![0u8; data.len()];
    timeout(STEP, busy.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(buf, data);

    let mut buf = [0u8; 4];
    timeout(STEP, behind.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"next");
}

#[tokio::test]
async fn test_too_many_peer_channels_is_fatal() {
    let (left, right) = factory_pair(MultiplexConfig {
        max_channels: 2,
        ..MultiplexConfig::default()
    });

    for id in 0..3 {
        // the third chunk may race the teardown
        let _ = left.create_channel(id).write_all(b"x").await;
    }

    timeout(STEP, right.wait_closed()).await.unwrap();
    assert_eq!(right.close_reason(), Some(CloseReason::ProtocolViolation));
    timeout(STEP, left.wait_closed()).await.unwrap();
    assert_eq!(left.close_reason(), Some(CloseReason::ConnectionClosed));
}

#[tokio::test]
async fn test_tokio_io_traits() {
    let (left, right) = factory_pair(MultiplexConfig::default());
    let mut writer = left.create_channel(5);
    let mut reader = right.create_channel(5);

    AsyncWriteExt::write_all(&mut writer, b"via traits").await.unwrap();
    writer.flush().await.unwrap();

    let mut buf = [0u8; 10];
    timeout(STEP, AsyncReadExt::read_exact(&mut reader, &mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"via traits");

    right.close();
    let mut rest = Vec::new();
    let n = timeout(STEP, reader.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_close_fails_readers_on_both_sides() {
    let left_token = CancellationToken::new();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let left = MultiplexedStreamFactory::new(a, left_token.clone());
    let right = MultiplexedStreamFactory::new(b, CancellationToken::new());
    left.open().unwrap();
    right.open().unwrap();

    let left_channel = left.create_channel(1);
    let right_channel = right.create_channel(1);

    left_token.cancel();

    let mut buf = [0u8; 4];
    assert!(matches!(
        timeout(STEP, left_channel.read_exact(&mut buf)).await.unwrap(),
        Err(FramewireError::Cancelled)
    ));
    assert!(matches!(
        timeout(STEP, right_channel.read_exact(&mut buf)).await.unwrap(),
        Err(FramewireError::ConnectionClosed)
    ));

    timeout(STEP, left.wait_closed()).await.unwrap();
    timeout(STEP, right.wait_closed()).await.unwrap();
    assert_eq!(left.close_reason(), Some(CloseReason::Cancelled));
    assert_eq!(right.close_reason(), Some(CloseReason::ConnectionClosed));
    assert!(!right.is_connection_open());

    assert!(left_channel.write_all(b"late").await.is_err());
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Greeting {
    text: String,
}

message_type!(Greeting => "Greeting");

#[tokio::test]
async fn test_message_sessions_over_channels() {
    let (left, right) = factory_pair(MultiplexConfig::default());
    let token = CancellationToken::new();

    let client = MessageClient::new(left.create_channel(10), token.clone());
    let server = MessageServer::new(right.create_channel(10), token.clone());
    client.open().unwrap();
    server.open().unwrap();

    // raw bytes on another channel keep flowing next to the session
    left.create_channel(11).write_all(b"side").await.unwrap();

    let request = client
        .send_data(&Greeting {
            text: "hi".to_string(),
        })
        .await
        .unwrap();
    let received = timeout(STEP, server.receive_data::<Greeting>())
        .await
        .unwrap()
        .unwrap();
    received
        .respond(&Greeting {
            text: format!("{} back", received.payload().text),
        })
        .await
        .unwrap();

    let reply = timeout(STEP, request.receive_data::<Greeting>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.payload().text, "hi back");

    let mut side = [0u8; 4];
    right.create_channel(11).read_exact(&mut side).await.unwrap();
    assert_eq!(&side, b"side");
}
