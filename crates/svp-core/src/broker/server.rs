//! Listener and connection tasks of the broker.
//!
//! The accept loop hands every connection to its own task. That task reads
//! frames, decodes them and forwards them to the broker task; a companion
//! writer drains the connection's outbound queue. Neither touches broker
//! state.

use super::actor::{Broker, BrokerEvent};
use crate::config::{BrokerConfig, BrokerLimits, Endpoint};
use crate::identity::ConnId;
use crate::wire::{read_frame, write_frame, Signal};
use crate::{Result, SvpError};
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle to a running broker. Dropping it shuts the broker down.
pub struct BrokerHandle {
    endpoint: Endpoint,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
    broker_task: Option<JoinHandle<()>>,
}

impl BrokerHandle {
    /// The endpoint actually bound; a TCP port of 0 is replaced by the
    /// port the OS assigned.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The TCP address, if listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn port(&self) -> Option<u16> {
        self.local_addr.map(|addr| addr.port())
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Shut down and wait until the broker task has drained.
    pub async fn join(mut self) {
        self.shutdown();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.broker_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.accept_task.take() {
            handle.abort();
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    async fn bind(endpoint: &Endpoint) -> Result<(Self, Endpoint)> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                let addr = listener.local_addr()?;
                let bound = Endpoint::Tcp {
                    host: host.clone(),
                    port: addr.port(),
                };
                Ok((Listener::Tcp(listener), bound))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    debug!("Removing stale socket {}", path.display());
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                Ok((Listener::Unix(listener, path.clone()), endpoint.clone()))
            }
        }
    }

    /// Remove the socket file of a Unix listener.
    fn cleanup(&self) {
        match self {
            Listener::Tcp(_) => {}
            #[cfg(unix)]
            Listener::Unix(_, path) => {
                if let Err(e) = std::fs::remove_file(path) {
                    debug!("Could not remove {}: {}", path.display(), e);
                }
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(..) => None,
        }
    }
}

/// Shared pieces every connection task needs.
#[derive(Clone)]
struct ConnContext {
    events: mpsc::Sender<BrokerEvent>,
    shutdown: watch::Receiver<bool>,
    frame_read_timeout: Duration,
    active: Arc<AtomicUsize>,
}

/// The broker server.
pub struct BrokerServer;

impl BrokerServer {
    /// Bind the configured endpoint and start the broker in background tasks.
    ///
    /// Fails if the endpoint cannot be bound.
    pub async fn start(config: BrokerConfig) -> Result<BrokerHandle> {
        let (listener, endpoint) = Listener::bind(&config.endpoint).await?;
        let local_addr = listener.local_addr();
        info!("SVP broker listening on {}", endpoint);

        let (event_tx, event_rx) = mpsc::channel(BrokerLimits::EVENT_QUEUE);
        let broker = Broker::new(&config);
        let broker_task = tokio::spawn(broker.run(event_rx));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let ctx = ConnContext {
            events: event_tx,
            shutdown: conn_shutdown_rx,
            frame_read_timeout: config.frame_read_timeout,
            active: Arc::new(AtomicUsize::new(0)),
        };

        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            ctx,
            config.max_connections,
            shutdown_rx,
        ));

        Ok(BrokerHandle {
            endpoint,
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            accept_task: Some(accept_task),
            broker_task: Some(broker_task),
        })
    }

    async fn accept_loop(
        listener: Listener,
        ctx: ConnContext,
        max_connections: usize,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut next_conn = 1u64;
        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("SVP broker shutting down");
                    break;
                }
                accepted = Self::accept(&listener, next_conn) => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            };

            let current = ctx.active.load(Ordering::Relaxed);
            if current >= max_connections {
                warn!(
                    "Rejecting connection from {}: at max capacity ({})",
                    peer, max_connections
                );
                continue;
            }

            let conn = ConnId(next_conn);
            next_conn += 1;
            ctx.active.fetch_add(1, Ordering::Relaxed);
            match stream {
                Accepted::Tcp(stream) => {
                    tokio::spawn(serve_connection(stream, conn, peer, ctx.clone()));
                }
                #[cfg(unix)]
                Accepted::Unix(stream) => {
                    tokio::spawn(serve_connection(stream, conn, peer, ctx.clone()));
                }
            }
        }

        listener.cleanup();
    }

    async fn accept(listener: &Listener, next_conn: u64) -> std::io::Result<(Accepted, String)> {
        match listener {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Accepted::Tcp(stream), addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((
                    Accepted::Unix(stream),
                    format!("unix:{}#{}", path.display(), next_conn),
                ))
            }
        }
    }
}

enum Accepted {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

async fn serve_connection<S>(stream: S, conn: ConnId, peer: String, mut ctx: ConnContext)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Signal>(BrokerLimits::OUTBOUND_QUEUE);
    let (close_tx, mut close_rx) = oneshot::channel::<()>();

    let connected = BrokerEvent::Connected {
        conn,
        peer: peer.clone(),
        outbound: outbound_tx,
        close: close_tx,
    };
    if ctx.events.send(connected).await.is_err() {
        ctx.active.fetch_sub(1, Ordering::Relaxed);
        return;
    }

    // Ends once the broker drops this connection's outbound sender, or is
    // aborted when the connection goes away.
    let writer_task = tokio::spawn(async move {
        while let Some(signal) = outbound_rx.recv().await {
            let bytes = match signal.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Cannot encode {} for {}: {}", signal.kind(), conn, e);
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut writer, &bytes).await {
                debug!("Write to {} failed: {}", conn, e);
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            result = read_frame(&mut reader, ctx.frame_read_timeout) => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("{} ({}) closed", conn, peer);
                    break;
                }
                Err(e @ SvpError::FrameTooLarge { .. }) => {
                    warn!("Dropping {} ({}): {}", conn, peer, e);
                    break;
                }
                Err(e) => {
                    debug!("{} ({}) read error: {}", conn, peer, e);
                    break;
                }
            },
            _ = &mut close_rx => {
                debug!("{} closed by broker", conn);
                break;
            }
            _ = ctx.shutdown.changed() => break,
        };

        let event = match Signal::decode(&frame) {
            Ok(signal) => BrokerEvent::Request { conn, signal },
            Err(error) => BrokerEvent::Malformed { conn, error },
        };
        if ctx.events.send(event).await.is_err() {
            break;
        }
    }

    let _ = ctx.events.send(BrokerEvent::Disconnected { conn }).await;
    // A writer blocked on a peer that stopped reading would otherwise keep
    // the socket open.
    writer_task.abort();
    ctx.active.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start() -> BrokerHandle {
        let config = BrokerConfig::builder().tcp("127.0.0.1", 0).build().unwrap();
        BrokerServer::start(config).await.unwrap()
    }

    async fn roundtrip(stream: &mut TcpStream, signal: &Signal) -> Signal {
        write_frame(stream, &signal.encode().unwrap()).await.unwrap();
        let frame = read_frame(stream, WAIT).await.unwrap().unwrap();
        Signal::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let mut handle = start().await;
        assert!(handle.port().unwrap() > 0);
        assert_eq!(
            handle.local_addr().unwrap().ip(),
            std::net::Ipv4Addr::LOCALHOST
        );
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_request_reply_over_tcp() {
        let handle = start().await;
        let mut stream = TcpStream::connect(handle.local_addr().unwrap()).await.unwrap();

        let identity = crate::identity::ProcessorIdentity::top_level(1001);
        let reply = roundtrip(&mut stream, &Signal::RegisterProcessor { identity, pid: 7 }).await;
        assert_eq!(reply, Signal::YesNo { yes: true });

        let reply = roundtrip(&mut stream, &Signal::IsRegistered { identity }).await;
        assert_eq!(reply, Signal::YesNo { yes: true });
        handle.join().await;
    }

    #[tokio::test]
    async fn test_unknown_kind_gets_error_reply() {
        let handle = start().await;
        let mut stream = TcpStream::connect(handle.local_addr().unwrap()).await.unwrap();

        write_frame(&mut stream, &[0x7f, 0x01, 0xaa]).await.unwrap();
        let frame = read_frame(&mut stream, WAIT).await.unwrap().unwrap();
        assert!(matches!(
            Signal::decode(&frame).unwrap(),
            Signal::Error { code, .. } if code == SvpError::CODE_PROTOCOL
        ));

        // the connection survives
        let reply = roundtrip(&mut stream, &Signal::PrintDatabase { format: 0 }).await;
        assert!(matches!(reply, Signal::DatabasePrinted { .. }));
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let handle = start().await;
        let mut stream = TcpStream::connect(handle.local_addr().unwrap()).await.unwrap();

        stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let result = read_frame(&mut stream, WAIT).await;
        assert!(matches!(result, Ok(None) | Err(_)));

        // the broker itself keeps serving
        let mut other = TcpStream::connect(handle.local_addr().unwrap()).await.unwrap();
        let reply = roundtrip(
            &mut other,
            &Signal::IsRegistered {
                identity: crate::identity::ProcessorIdentity::top_level(1001),
            },
        )
        .await;
        assert_eq!(reply, Signal::YesNo { yes: false });
    }
}
