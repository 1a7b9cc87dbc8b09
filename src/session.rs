//! Per-connection protocol.
//!
//! A session reads chunks from the client and appends each one to the store
//! as soon as it arrives. When a chunk ends in `\n` the message is complete
//! and the entire store is streamed back to the client, after which the
//! session is over. Only the last byte of the freshly read chunk is checked
//! for the terminator.

use crate::storage::Store;
use std::io::{self, Read, Write};
use tracing::{error, trace};

/// Size of the playback buffer. Client reads use one byte less.
pub const BUFFER_SIZE: usize = 512;

/// Largest single read from the client.
pub const READ_CHUNK: usize = BUFFER_SIZE - 1;

const TERMINATOR: u8 = b'\n';

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A full message arrived and the store was played back.
    Echoed { bytes: u64 },
    /// The client closed before sending a terminator.
    PeerClosed,
    /// Reading from the client failed.
    ReadFailed,
    /// Appending to the store failed.
    StoreFailed,
    /// Playback was cut short by a store read or client write failure.
    PlaybackFailed,
}

/// Serve one client until its message completes or the connection fails.
///
/// Bytes already appended are never rolled back, whatever the outcome.
pub fn handle<S: Read + Write>(stream: &mut S, store: &mut Store) -> SessionOutcome {
    let mut buf = [0u8; BUFFER_SIZE];

    loop {
        let n = match stream.read(&mut buf[..READ_CHUNK]) {
            Ok(0) => return SessionOutcome::PeerClosed,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(op = "read", error = %e, "Client read failed");
                return SessionOutcome::ReadFailed;
            }
        };

        let chunk = &buf[..n];
        trace!(bytes = n, "Received chunk");

        if let Err(e) = store.append(chunk) {
            error!(op = "write", path = %store.path().display(), error = %e, "Store append failed");
            return SessionOutcome::StoreFailed;
        }

        if chunk.last() == Some(&TERMINATOR) {
            return match playback(stream, store, &mut buf) {
                Some(bytes) => SessionOutcome::Echoed { bytes },
                None => SessionOutcome::PlaybackFailed,
            };
        }
    }
}

/// Stream the whole store, from its first byte, to the client.
fn playback<W: Write>(out: &mut W, store: &mut Store, buf: &mut [u8]) -> Option<u64> {
    if let Err(e) = store.rewind() {
        error!(op = "seek", error = %e, "Store rewind failed");
        return None;
    }

    let mut total = 0u64;
    loop {
        let n = match store.read_chunk(buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(op = "fread", error = %e, "Store read failed");
                return None;
            }
        };

        if let Err(e) = out.write_all(&buf[..n]) {
            error!(op = "write", error = %e, "Client write failed");
            return None;
        }
        total += n as u64;
    }

    if let Err(e) = out.flush() {
        error!(op = "write", error = %e, "Client flush failed");
        return None;
    }

    trace!(bytes = total, "Playback complete");
    Some(total)
}
