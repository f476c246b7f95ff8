//! Line-framed transport with optional sealing.
//!
//! Each on-wire frame is the Base85 armoring (RFC 1924 alphabet) of a
//! payload, followed by five newline bytes. Armoring is applied whether or
//! not the cipher is active, so the wire always carries the same alphabet.
//! The Base85 alphabet contains no newline, so the terminator is unambiguous.
//!
//! Frames that fail to de-armor, open, or verify are yielded inline as
//! crypto errors and dropped by the caller; only transport failures end the
//! inbound sequence.

use super::types::{FRAME_TERMINATOR, MAX_FRAME_BYTES};
use crate::crypto::{Cipher, CryptoError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream ended mid-frame after {0} bytes")]
    StreamEnded(usize),

    #[error("frame exceeds {MAX_FRAME_BYTES} bytes")]
    Oversized,

    #[error("invalid armoring: {0}")]
    Armor(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Why the inbound frame sequence stopped.
#[derive(Debug)]
pub enum CloseReason {
    /// Remote closed at a frame boundary.
    Eof,
    /// The local side closed the connection.
    Local,
    /// Transport failure; EOF mid-frame included.
    Failed(FrameError),
}

/// One step of the inbound frame sequence.
pub enum FrameRead {
    /// A de-armored (and, once the cipher is active, opened and verified)
    /// payload.
    Line(Vec<u8>),
    /// The frame could not be recovered. Not fatal; the caller logs and
    /// continues.
    Crypto(FrameError),
    Closed(CloseReason),
}

/// State shared between the two halves of a connection: the cipher, the
/// liveness flag, and the post-armor byte counters.
pub struct Transport {
    cipher: Mutex<Cipher>,
    can_encrypt: bool,
    open: AtomicBool,
    total_sent: AtomicU64,
    total_recv: AtomicU64,
}

impl Transport {
    fn new(can_encrypt: bool) -> Self {
        Self {
            cipher: Mutex::new(Cipher::new()),
            can_encrypt,
            open: AtomicBool::new(true),
            total_sent: AtomicU64::new(0),
            total_recv: AtomicU64::new(0),
        }
    }

    pub fn cipher(&self) -> &Mutex<Cipher> {
        &self.cipher
    }

    /// Whether this side may negotiate encryption at all.
    pub fn can_encrypt(&self) -> bool {
        self.can_encrypt
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Flip the liveness flag. Subsequent sends short-circuit; the reader
    /// reports a local close at its next step.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Framed bytes written so far, terminators included.
    pub fn total_sent(&self) -> u64 {
        self.total_sent.load(Ordering::SeqCst)
    }

    /// Framed bytes read so far, terminators included.
    pub fn total_recv(&self) -> u64 {
        self.total_recv.load(Ordering::SeqCst)
    }
}

/// A framed duplex stream, ready to be split into its two task-owned halves.
pub struct Framed {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Framed {
    pub fn new(stream: TcpStream, can_encrypt: bool) -> Self {
        let transport = Arc::new(Transport::new(can_encrypt));
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader {
                reader: BufReader::new(read_half),
                transport: transport.clone(),
            },
            writer: FrameWriter {
                writer: Mutex::new(write_half),
                transport,
            },
        }
    }

    pub fn split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// Read half. Owned by the single reader task of a peer.
pub struct FrameReader {
    reader: BufReader<ReadHalf<TcpStream>>,
    transport: Arc<Transport>,
}

impl FrameReader {
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Pull the next frame. Crypto failures are yielded inline; transport
    /// failures and closure end the sequence.
    pub async fn next(&mut self) -> FrameRead {
        if !self.transport.is_open() {
            return FrameRead::Closed(CloseReason::Local);
        }

        let mut buf: Vec<u8> = Vec::new();
        loop {
            match self.reader.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    return if buf.is_empty() {
                        FrameRead::Closed(CloseReason::Eof)
                    } else {
                        FrameRead::Closed(CloseReason::Failed(FrameError::StreamEnded(buf.len())))
                    };
                }
                Ok(_) => {}
                Err(e) => return FrameRead::Closed(CloseReason::Failed(e.into())),
            }
            if buf.ends_with(FRAME_TERMINATOR) {
                break;
            }
            if buf.len() > MAX_FRAME_BYTES {
                return FrameRead::Closed(CloseReason::Failed(FrameError::Oversized));
            }
        }

        self.transport
            .total_recv
            .fetch_add(buf.len() as u64, Ordering::SeqCst);

        let armored = &buf[..buf.len() - FRAME_TERMINATOR.len()];
        if armored.is_empty() {
            // A bare terminator is how a closing remote flushes its stream.
            debug!("empty frame; treating as end of stream");
            return FrameRead::Closed(CloseReason::Eof);
        }

        let armored = match std::str::from_utf8(armored) {
            Ok(s) => s,
            Err(e) => return FrameRead::Crypto(FrameError::Armor(e.to_string())),
        };
        let wire = match base85::decode(armored) {
            Ok(bytes) => bytes,
            Err(e) => return FrameRead::Crypto(FrameError::Armor(e.to_string())),
        };

        match self.transport.cipher.lock().await.open(&wire) {
            Ok(payload) => FrameRead::Line(payload),
            Err(e) => FrameRead::Crypto(e.into()),
        }
    }
}

/// Write half. Shared by every task that sends on the peer; the inner mutex
/// keeps a frame's bytes from interleaving with another frame's.
pub struct FrameWriter {
    writer: Mutex<WriteHalf<TcpStream>>,
    transport: Arc<Transport>,
}

impl FrameWriter {
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Seal, armor, and write one frame. Returns the framed byte count.
    /// Short-circuits to zero once the connection is closed.
    pub async fn send(&self, payload: &[u8]) -> Result<u64, FrameError> {
        if !self.transport.is_open() {
            return Ok(0);
        }

        let sealed = self.transport.cipher.lock().await.seal(payload)?;
        let armored = base85::encode(&sealed);

        let mut writer = self.writer.lock().await;
        writer.write_all(armored.as_bytes()).await?;
        writer.write_all(FRAME_TERMINATOR).await?;
        writer.flush().await?;

        let count = (armored.len() + FRAME_TERMINATOR.len()) as u64;
        self.transport.total_sent.fetch_add(count, Ordering::SeqCst);
        Ok(count)
    }

    /// Close the write direction and mark the connection closed.
    pub async fn close(&self) {
        self.transport.mark_closed();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = TcpStream::connect(addr);
        let (accepted, dialed) = tokio::join!(listener.accept(), dial);
        (accepted.unwrap().0, dialed.unwrap())
    }

    #[tokio::test]
    async fn plaintext_round_trip() {
        let (a, b) = tcp_pair().await;
        let (_ra, wa) = Framed::new(a, true).split();
        let (mut rb, _wb) = Framed::new(b, true).split();

        wa.send(br#"{"jsonrpc":"2.0","method":"PING"}"#).await.unwrap();
        match rb.next().await {
            FrameRead::Line(line) => {
                assert_eq!(line, br#"{"jsonrpc":"2.0","method":"PING"}"#)
            }
            _ => panic!("expected a line"),
        }
    }

    #[tokio::test]
    async fn frames_do_not_bleed() {
        let (a, b) = tcp_pair().await;
        let (_ra, wa) = Framed::new(a, true).split();
        let (mut rb, _wb) = Framed::new(b, true).split();

        wa.send(b"first").await.unwrap();
        wa.send(b"second").await.unwrap();

        match rb.next().await {
            FrameRead::Line(line) => assert_eq!(line, b"first"),
            _ => panic!("expected first line"),
        }
        match rb.next().await {
            FrameRead::Line(line) => assert_eq!(line, b"second"),
            _ => panic!("expected second line"),
        }
    }

    #[tokio::test]
    async fn counters_track_framed_bytes() {
        let (a, b) = tcp_pair().await;
        let (_ra, wa) = Framed::new(a, true).split();
        let (mut rb, _wb) = Framed::new(b, true).split();

        let sent = wa.send(b"counted").await.unwrap();
        assert_eq!(wa.transport().total_sent(), sent);

        match rb.next().await {
            FrameRead::Line(_) => {}
            _ => panic!("expected a line"),
        }
        assert_eq!(rb.transport().total_recv(), sent);
    }

    #[tokio::test]
    async fn eof_mid_frame_is_stream_ended() {
        let (mut a, b) = tcp_pair().await;
        let (mut rb, _wb) = Framed::new(b, true).split();

        // A partial frame with no terminator, then EOF.
        a.write_all(b"orphan-bytes\n").await.unwrap();
        a.shutdown().await.unwrap();
        drop(a);

        match rb.next().await {
            FrameRead::Closed(CloseReason::Failed(FrameError::StreamEnded(n))) => {
                assert!(n > 0)
            }
            _ => panic!("expected stream-ended"),
        }
    }

    #[tokio::test]
    async fn clean_eof_at_boundary() {
        let (a, b) = tcp_pair().await;
        let (mut rb, _wb) = Framed::new(b, true).split();

        let (_ra, wa) = Framed::new(a, true).split();
        wa.send(b"last words").await.unwrap();
        wa.close().await;

        match rb.next().await {
            FrameRead::Line(line) => assert_eq!(line, b"last words"),
            _ => panic!("expected the final line"),
        }
        match rb.next().await {
            FrameRead::Closed(CloseReason::Eof) => {}
            _ => panic!("expected clean EOF"),
        }
    }

    #[tokio::test]
    async fn closed_writer_short_circuits() {
        let (a, _b) = tcp_pair().await;
        let (_ra, wa) = Framed::new(a, true).split();
        wa.close().await;
        assert_eq!(wa.send(b"into the void").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sealed_round_trip_and_tamper_recovery() {
        let (a, mut raw) = tcp_pair().await;
        let (mut ra, _wa) = Framed::new(a, true).split();

        // Stand-in for the remote side's cipher, driven by hand so the test
        // controls the exact bytes on the wire.
        let mut remote = crate::crypto::Cipher::new();
        {
            let mut local = ra.transport().cipher().lock().await;
            remote
                .stage(&local.public_hex(), &local.verify_hex())
                .unwrap();
            let _ = remote.activate();
            local
                .stage(&remote.public_hex(), &remote.verify_hex())
                .unwrap();
            assert!(local.activate());
        }

        fn armored_frame(bytes: Vec<u8>) -> Vec<u8> {
            let mut frame = base85::encode(&bytes).into_bytes();
            frame.extend_from_slice(FRAME_TERMINATOR);
            frame
        }

        // Frame 1: intact ciphertext.
        let frame = armored_frame(remote.seal(b"secret one").unwrap());
        raw.write_all(&frame).await.unwrap();
        match ra.next().await {
            FrameRead::Line(line) => assert_eq!(line, b"secret one"),
            _ => panic!("expected decrypted line"),
        }

        // Frame 2: one flipped ciphertext byte. Dropped, not fatal.
        let mut sealed = remote.seal(b"secret two").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        let frame = armored_frame(sealed);
        raw.write_all(&frame).await.unwrap();
        match ra.next().await {
            FrameRead::Crypto(_) => {}
            _ => panic!("expected inline crypto error"),
        }

        // Frame 3: the stream still decrypts.
        let frame = armored_frame(remote.seal(b"secret three").unwrap());
        raw.write_all(&frame).await.unwrap();
        match ra.next().await {
            FrameRead::Line(line) => assert_eq!(line, b"secret three"),
            _ => panic!("expected recovery after tamper"),
        }
    }
}
