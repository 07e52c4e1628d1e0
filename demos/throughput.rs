//! Throughput driver - request/response load over TCP.
//!
//! ```text
//! cargo run --example throughput -- listen 127.0.0.1:9000 256
//! cargo run --example throughput -- transmit 127.0.0.1:9000 0 10000 1024
//! ```
//!
//! `listen` answers every request with a reply of `responseSize` bytes.
//! `transmit` sends `numRequests` requests of `requestSize` bytes, pacing
//! frames by `delayMs`, then waits for every reply and reports the rate.

use std::time::{Duration, Instant};

use framewire::{message_type, FramewireError, MessageServer, TransportBuilder};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[derive(Serialize, Deserialize)]
struct Request {
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct Response {
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

message_type!(Request => "throughput.Request", Response => "throughput.Response");

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["listen", addr, response_size] => listen(addr, response_size.parse()?).await,
        ["transmit", addr, delay_ms, num_requests, request_size] => {
            transmit(
                addr,
                Duration::from_millis(delay_ms.parse()?),
                num_requests.parse()?,
                request_size.parse()?,
            )
            .await
        }
        _ => {
            eprintln!("usage: throughput listen <addr:port> <responseSize>");
            eprintln!("       throughput transmit <addr:port> <delayMs> <numRequests> <requestSize>");
            std::process::exit(2);
        }
    }
}

async fn listen(addr: &str, response_size: usize) -> Result<(), BoxError> {
    let listener = TcpListener::bind(addr).await?;
    let token = CancellationToken::new();
    tracing::info!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let server = MessageServer::new(stream, token.child_token());
        server.open()?;
        tracing::info!("Accepted {}", peer);

        tokio::spawn(async move {
            let reply = Response {
                data: vec![0x5a; response_size],
            };
            let mut served = 0u64;
            loop {
                match server.receive_data::<Request>().await {
                    Ok(request) => {
                        if let Err(e) = request.respond(&reply).await {
                            tracing::warn!("Reply to {} failed: {}", peer, e);
                            break;
                        }
                        served += 1;
                    }
                    Err(FramewireError::ConnectionClosed) => break,
                    Err(e) => {
                        tracing::warn!("Session with {} ended: {}", peer, e);
                        break;
                    }
                }
            }
            tracing::info!("{} disconnected after {} requests", peer, served);
        });
    }
}

async fn transmit(
    addr: &str,
    delay: Duration,
    num_requests: usize,
    request_size: usize,
) -> Result<(), BoxError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;

    let token = CancellationToken::new();
    let client = TransportBuilder::new()
        .min_delay(delay)
        .client(stream, token.clone());
    client.open()?;

    let request = Request {
        data: vec![0xa5; request_size],
    };

    let started = Instant::now();
    let mut pending = Vec::with_capacity(num_requests);
    for _ in 0..num_requests {
        pending.push(client.send_data(&request).await?);
    }
    let sent = started.elapsed();

    let mut received_bytes = 0usize;
    for result in pending {
        let reply = result.receive_data::<Response>().await?;
        received_bytes += reply.payload().data.len();
    }
    let elapsed = started.elapsed();

    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    tracing::info!(
        requests = num_requests,
        sent_ms = sent.as_millis() as u64,
        total_ms = elapsed.as_millis() as u64,
        "Done: {:.0} req/s, {:.2} MB/s out, {:.2} MB/s in",
        num_requests as f64 / secs,
        (num_requests * request_size) as f64 / secs / 1e6,
        received_bytes as f64 / secs / 1e6,
    );

    client.close();
    client.wait_closed().await;
    Ok(())
}
