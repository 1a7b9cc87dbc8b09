//! TCP server for the line-framed append-and-playback service.
//!
//! One thread, one client at a time. The listener and a shutdown waker are
//! registered with a mio `Poll`; the loop blocks in `poll` between clients.
//! Each accepted connection is switched back to blocking mode and served to
//! completion before the next one is accepted, so pending clients simply
//! wait in the listen backlog.

use crate::config::Config;
use crate::error::SetupError;
use crate::session::{self, SessionOutcome};
use crate::shutdown::ShutdownHandle;
use crate::storage::Store;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use tracing::{debug, error, info};

const LISTENER_TOKEN: Token = Token(0);
const SHUTDOWN_TOKEN: Token = Token(1);

const EVENTS_CAPACITY: usize = 8;

/// Server instance
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    store: Store,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Open the store and start listening.
    ///
    /// Every failure here is fatal; nothing is accepted until this returns.
    pub fn bind(config: &Config) -> Result<Self, SetupError> {
        let addr = config.listen_addr()?;
        let store = Store::open(&config.store_path).map_err(SetupError::StoreOpen)?;
        let listener = create_listener(addr, config.backlog)?;
        let local_addr = listener.local_addr().map_err(SetupError::Socket)?;

        let mut listener = TcpListener::from_std(listener);
        let poll = Poll::new().map_err(SetupError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(SetupError::Poll)?;
        let shutdown =
            ShutdownHandle::new(poll.registry(), SHUTDOWN_TOKEN).map_err(SetupError::Poll)?;

        info!(
            addr = %local_addr,
            backlog = config.backlog,
            store = %store.path().display(),
            "Server listening"
        );

        Ok(Server {
            poll,
            listener,
            store,
            shutdown,
        })
    }

    /// Get the bound address for testing
    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle that stops the accept loop at the next connection boundary.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept and serve clients until shutdown is requested, then delete the store.
    pub fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.shutdown.is_requested() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!(op = "poll", error = %e, "Poll failed");
                }
                continue;
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_pending();
                }
            }
        }

        debug!("Caught signal, exiting");
        let path = self.store.path().to_path_buf();
        if let Err(e) = self.store.remove() {
            error!(op = "unlink", path = %path.display(), error = %e, "Failed to delete store");
        }
    }

    /// Drain the backlog, serving each client in turn.
    fn accept_pending(&mut self) {
        while !self.shutdown.is_requested() {
            match self.listener.accept() {
                Ok((stream, peer)) => self.serve(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(op = "accept", error = %e, "Accept failed");
                }
            }
        }
    }

    fn serve(&mut self, stream: TcpStream, peer: SocketAddr) {
        let peer_ip = peer.ip();
        debug!("Accepted connection from {}", peer_ip);

        match into_blocking(stream) {
            Ok(mut stream) => match session::handle(&mut stream, &mut self.store) {
                SessionOutcome::Echoed { bytes } => {
                    debug!(peer = %peer_ip, bytes, "Played back store");
                }
                SessionOutcome::PeerClosed => {
                    debug!(peer = %peer_ip, "Client closed before completing a message");
                }
                // Already logged where the failure happened.
                _ => {}
            },
            Err(e) => error!(op = "fcntl", error = %e, "Failed to prepare client socket"),
        }

        debug!("Closed connection from {}", peer_ip);

        if let Err(e) = self.store.reset() {
            error!(op = "unlink", path = %self.store.path().display(), error = %e, "Failed to reset store");
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener, SetupError> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(SetupError::Socket)?;

    socket
        .set_reuse_address(true)
        .map_err(SetupError::SetSockOpt)?;
    socket.bind(&addr.into()).map_err(SetupError::Bind)?;
    socket.listen(backlog).map_err(SetupError::Listen)?;
    socket
        .set_nonblocking(true)
        .map_err(SetupError::SetSockOpt)?;

    Ok(socket.into())
}

/// Sessions use plain blocking I/O.
fn into_blocking(stream: TcpStream) -> io::Result<std::net::TcpStream> {
    // SAFETY: the descriptor was just released by `into_raw_fd`, so the new
    // std stream is its only owner.
    let stream = unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };
    stream.set_nonblocking(false)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::Shutdown;
    use std::path::PathBuf;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    struct TestServer {
        addr: SocketAddr,
        store_path: PathBuf,
        shutdown: ShutdownHandle,
        thread: Option<JoinHandle<()>>,
        _dir: tempfile::TempDir,
    }

    impl TestServer {
        fn start() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store_path = dir.path().join("aesdsocketdata");
            let server = Server::bind(&test_config(store_path.clone())).unwrap();
            let addr = server.local_addr().unwrap();
            let shutdown = server.shutdown_handle();
            let thread = thread::spawn(move || server.run());

            TestServer {
                addr,
                store_path,
                shutdown,
                thread: Some(thread),
                _dir: dir,
            }
        }

        fn connect(&self) -> std::net::TcpStream {
            let stream = std::net::TcpStream::connect(self.addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
        }

        fn stop(&mut self) {
            self.shutdown.trigger();
            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn test_config(store_path: PathBuf) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            backlog: 10,
            store_path,
            daemon: false,
            log_level: "debug".to_string(),
        }
    }

    fn exchange(stream: &mut std::net::TcpStream, parts: &[&[u8]]) -> Vec<u8> {
        for part in parts {
            stream.write_all(part).unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
        reply
    }

    #[test]
    fn test_echo_then_isolated_second_session() {
        let server = TestServer::start();

        let mut first = server.connect();
        assert_eq!(exchange(&mut first, &[b"hello\n"]), b"hello\n");

        let mut second = server.connect();
        assert_eq!(exchange(&mut second, &[b"world\n"]), b"world\n");
    }

    #[test]
    fn test_split_message_echoed_once() {
        let server = TestServer::start();

        let mut client = server.connect();
        assert_eq!(exchange(&mut client, &[b"foo", b"bar\n"]), b"foobar\n");
    }

    #[test]
    fn test_queued_client_served_after_first() {
        let server = TestServer::start();

        let mut first = server.connect();
        first.write_all(b"first ").unwrap();
        thread::sleep(Duration::from_millis(50));

        // Sits in the backlog while the first session is open.
        let mut second = server.connect();
        second.write_all(b"second\n").unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(exchange(&mut first, &[b"half\n"]), b"first half\n");
        assert_eq!(exchange(&mut second, &[]), b"second\n");
    }

    #[test]
    fn test_disconnect_mid_message_leaves_no_residue() {
        let server = TestServer::start();

        let mut quitter = server.connect();
        quitter.write_all(b"never finished").unwrap();
        quitter.shutdown(Shutdown::Write).unwrap();
        let mut reply = Vec::new();
        quitter.read_to_end(&mut reply).unwrap();
        assert!(reply.is_empty());

        let mut next = server.connect();
        assert_eq!(exchange(&mut next, &[b"clean\n"]), b"clean\n");
    }

    #[test]
    fn test_store_removed_between_sessions() {
        let server = TestServer::start();

        let mut client = server.connect();
        exchange(&mut client, &[b"data\n"]);

        // Teardown runs right after the server closes its end.
        thread::sleep(Duration::from_millis(50));
        assert!(!server.store_path.exists());
    }

    #[test]
    fn test_shutdown_while_idle_deletes_store() {
        let mut server = TestServer::start();
        assert!(server.store_path.exists());

        server.stop();
        assert!(!server.store_path.exists());
    }

    #[test]
    fn test_bind_fails_when_port_taken() {
        let dir = tempfile::tempdir().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let mut config = test_config(dir.path().join("aesdsocketdata"));
        config.port = taken.local_addr().unwrap().port();

        assert!(matches!(Server::bind(&config), Err(SetupError::Bind(_))));
    }

    #[test]
    fn test_bind_fails_when_store_unopenable() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().join("missing").join("aesdsocketdata"));

        assert!(matches!(
            Server::bind(&config),
            Err(SetupError::StoreOpen(_))
        ));
    }
}
