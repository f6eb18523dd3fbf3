//! Connection pooling over plain TCP.
//!
//! Starts a local echo server, then pools TCP connections to it and shows
//! reuse, queueing under load, and disposal.
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=netpool=debug cargo run --example connection_pool
//! ```

// Allow common patterns in example code
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use netpool::{BoxError, Connection, ConnectionProvider, DestinationKey, PoolError, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

/// A pooled TCP stream.
struct TcpConnection {
    stream: TcpStream,
    broken: bool,
}

impl TcpConnection {
    async fn echo(&mut self, message: &[u8]) -> std::io::Result<Vec<u8>> {
        let result = async {
            self.stream.write_all(message).await?;
            let mut buf = vec![0; message.len()];
            self.stream.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        }
        .await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }
}

impl Connection for TcpConnection {
    fn is_healthy(&self) -> bool {
        !self.broken
    }
}

struct TcpTransport {
    connect_timeout: Duration,
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    type Connection = TcpConnection;

    async fn connect(&self, destination: &DestinationKey) -> Result<TcpConnection, BoxError> {
        let stream =
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(destination.address()))
                .await??;
        stream.set_nodelay(true)?;
        Ok(TcpConnection {
            stream,
            broken: false,
        })
    }

    async fn close(&self, mut connection: TcpConnection) {
        let _ = connection.stream.shutdown().await;
    }
}

async fn echo_server() -> std::io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    Ok(address)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let address = echo_server().await?;
    let destination = DestinationKey::new(address.as_str());

    println!("=== Connection Pool Example ===\n");

    let provider = netpool::builder("echo")
        .max_connections(4)?
        .max_pending_acquire(32)?
        .acquire_timeout(Duration::from_secs(2))
        .max_idle_time(Duration::from_secs(30))
        .build(TcpTransport {
            connect_timeout: Duration::from_secs(1),
        });

    println!("Pool configuration:");
    println!("  Max connections: {}", provider.max_connections());
    println!();

    // Example 1: Basic usage
    println!("1. Basic pool usage:");
    {
        let mut conn = provider.acquire(destination.clone()).await?;
        let reply = conn.echo(b"hello").await?;
        println!(
            "  connection #{} echoed {:?}",
            conn.metadata().id,
            String::from_utf8_lossy(&reply)
        );
        // Connection is automatically returned to pool when dropped
    }
    print_status(&provider, &destination);

    // Example 2: Reuse
    println!("\n2. Reusing the idle connection:");
    {
        let conn = provider.acquire(destination.clone()).await?;
        println!(
            "  got connection #{} (checked out {} times)",
            conn.metadata().id,
            conn.metadata().acquire_count
        );
    }

    // Example 3: More callers than connections
    println!("\n3. Pool under load (16 callers, 4 connections):");
    let start = Instant::now();
    let mut handles = vec![];
    for i in 0..16u8 {
        let provider = provider.clone();
        let destination = destination.clone();
        handles.push(tokio::spawn(async move {
            let mut conn = provider.acquire(destination).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            conn.echo(&[i]).await.map_err(|e| PoolError::ConnectionCreation(e.into()))?;
            Ok::<_, PoolError>(conn.metadata().id)
        }));
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    print_status(&provider, &destination);

    let mut completed = 0;
    for handle in handles {
        if handle.await?.is_ok() {
            completed += 1;
        }
    }
    println!("  Completed {} round trips in {:?}", completed, start.elapsed());
    print_status(&provider, &destination);

    // Example 4: Disposal
    println!("\n4. Graceful shutdown:");
    provider.dispose_later().await;
    match provider.acquire(destination.clone()).await {
        Err(e) if e.is_closed() => println!("  acquire after dispose: {e}"),
        other => println!("  unexpected: {other:?}"),
    }

    Ok(())
}

fn print_status(provider: &ConnectionProvider<TcpTransport>, destination: &DestinationKey) {
    if let Some(status) = provider.status(destination) {
        println!(
            "  Status: {} in use, {} idle, {} pending, {}/{} connections ({:.1}% utilization)",
            status.in_use,
            status.available,
            status.pending,
            status.total,
            status.max,
            status.utilization()
        );
    }
}
