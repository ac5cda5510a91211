//! The I/O channel: a single-use server endpoint
//! that accepts exactly one connection, used to relay one standard stream
//! between host and guest process. The RPC that advertises the channel's
//! port can complete before the guest dials in without racing, because
//! `read`/`write`/`close_write` all block on the same "ready" signal the
//! accept task raises.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// A duplex connection: whatever the socket dialer/listener collaborator
/// handed back after accept. The core only needs read/write/shutdown.
pub trait DuplexConnection: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexConnection for T {}

/// A listener bound to one port, capable of accepting exactly one
/// connection. External collaborator; the core only names the interface.
#[async_trait]
pub trait ServerEndpoint: Send {
    async fn accept(&mut self) -> io::Result<Box<dyn DuplexConnection>>;
}

/// Binds a new `ServerEndpoint` on `port`. Supplied externally (hypervisor
/// socket / named pipe / UNIX pipe implementation); the core has no
/// further dependency on it beyond this signature.
#[async_trait]
pub trait SocketListener: Send + Sync {
    async fn listen(&self, port: u32) -> io::Result<Box<dyn ServerEndpoint>>;
}

enum State {
    Pending,
    Ready(Box<dyn DuplexConnection>),
    Failed(String),
    Closed,
}

/// One standard stream (stdin, stdout, or stderr) between host and guest
/// process.
pub struct IoChannel {
    state: Mutex<State>,
    ready: Notify,
    cancel: CancellationToken,
}

impl IoChannel {
    /// Spawns the one-shot accept task and returns immediately; `accept`
    /// is only ever called once over the channel's lifetime.
    pub fn new(mut endpoint: Box<dyn ServerEndpoint>) -> std::sync::Arc<IoChannel> {
        let channel = std::sync::Arc::new(IoChannel {
            state: Mutex::new(State::Pending),
            ready: Notify::new(),
            cancel: CancellationToken::new(),
        });

        let task_channel = channel.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = task_channel.cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Other, "io channel closed before accept")),
                result = endpoint.accept() => result,
            };

            let mut state = task_channel.state.lock().await;
            // `close()` may have raced us to `Closed` already; don't
            // clobber it with a late accept outcome.
            if matches!(*state, State::Pending) {
                *state = match outcome {
                    Ok(conn) => State::Ready(conn),
                    Err(err) => State::Failed(err.to_string()),
                };
            }
            drop(state);
            task_channel.ready.notify_waiters();
        });

        channel
    }

    async fn wait_ready(&self) -> Result<(), io::Error> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            {
                let state = self.state.lock().await;
                match &*state {
                    State::Pending => {}
                    State::Ready(_) => return Ok(()),
                    State::Failed(msg) => return Err(io::Error::new(io::ErrorKind::Other, msg.clone())),
                    State::Closed => {
                        return Err(io::Error::new(io::ErrorKind::Other, "io channel closed"))
                    }
                }
            }
            notified.await;
        }
    }

    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.wait_ready().await?;
        let mut state = self.state.lock().await;
        match &mut *state {
            State::Ready(conn) => conn.read(buf).await,
            State::Failed(msg) => Err(io::Error::new(io::ErrorKind::Other, msg.clone())),
            State::Closed | State::Pending => {
                Err(io::Error::new(io::ErrorKind::Other, "io channel not connected"))
            }
        }
    }

    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.wait_ready().await?;
        let mut state = self.state.lock().await;
        match &mut *state {
            State::Ready(conn) => conn.write(buf).await,
            State::Failed(msg) => Err(io::Error::new(io::ErrorKind::Other, msg.clone())),
            State::Closed | State::Pending => {
                Err(io::Error::new(io::ErrorKind::Other, "io channel not connected"))
            }
        }
    }

    /// Half-closes the peer connection's write side.
    pub async fn close_write(&self) -> io::Result<()> {
        self.wait_ready().await?;
        let mut state = self.state.lock().await;
        if let State::Ready(conn) = &mut *state {
            conn.shutdown().await
        } else {
            Ok(())
        }
    }

    /// Shuts down the server (aborting a pending accept) and the peer
    /// connection, if any. Safe to call before the peer has connected.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut state = self.state.lock().await;
        if let State::Ready(conn) = &mut *state {
            let _ = conn.shutdown().await;
        }
        *state = State::Closed;
        drop(state);
        self.ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// A `ServerEndpoint` that yields one end of an in-memory duplex pair
    /// the moment `accept` is called, standing in for a hypervisor socket
    /// listener in tests.
    struct OneShotEndpoint {
        conn: Option<DuplexStream>,
    }

    #[async_trait]
    impl ServerEndpoint for OneShotEndpoint {
        async fn accept(&mut self) -> io::Result<Box<dyn DuplexConnection>> {
            Ok(Box::new(self.conn.take().expect("accept called twice")))
        }
    }

    /// Never resolves; used to exercise `close()` racing a pending accept.
    struct NeverAcceptEndpoint;

    #[async_trait]
    impl ServerEndpoint for NeverAcceptEndpoint {
        async fn accept(&mut self) -> io::Result<Box<dyn DuplexConnection>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn read_write_block_until_accept_then_delegate() {
        let (ours, theirs) = tokio::io::duplex(64);
        let channel = IoChannel::new(Box::new(OneShotEndpoint { conn: Some(ours) }));

        let mut peer = theirs;
        channel.write(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn close_before_connect_still_signals_ready() {
        let channel = IoChannel::new(Box::new(NeverAcceptEndpoint));
        channel.close().await;

        let err = channel.read(&mut [0u8; 1]).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn port_advertised_before_peer_connects_is_race_free() {
        // Simulates the exact race this type exists to avoid: the RPC
        // advertising the port completes (here, just constructing the
        // channel) strictly before the "guest" dials in.
        let (ours, theirs) = tokio::io::duplex(64);
        let connected = Arc::new(AtomicBool::new(false));
        let channel = IoChannel::new(Box::new(OneShotEndpoint { conn: Some(ours) }));

        // No connection exists yet; a read issued immediately must still
        // block rather than fail.
        let read_channel = channel.clone();
        let flag = connected.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 2];
            read_channel.read(&mut buf).await.unwrap();
            assert!(flag.load(Ordering::SeqCst));
            buf
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        connected.store(true, Ordering::SeqCst);
        let mut peer = theirs;
        peer.write_all(b"hi").await.unwrap();

        let buf = reader.await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
