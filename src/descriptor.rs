//! The request descriptor machinery: every request that crosses the
//! writer/reader split -- a single control op as much as a chunked
//! `ReadAt`/`WriteAt` -- is represented here as a [`Descriptor`]. The writer
//! task reserves a contiguous id range for it and runs its [`Pump`] to
//! completion before touching the next queued descriptor (no other caller's
//! bytes can land in between); the reader task feeds each response packet to
//! the descriptor's [`ResponseHandler`], buffering the payload first unless
//! the descriptor asked for manual-respond mode, in which case the handler
//! reads the bulk payload straight off the transport itself.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Error;
use crate::message::Message;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The 9 bytes every response begins with: length prefix, type, request id.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub frame_len: u32,
    pub kind: u8,
    pub id: u32,
}

impl FrameHeader {
    /// Bytes remaining in the frame once type and id are accounted for --
    /// what a manual-respond handler or the reader's own buffering must
    /// still consume.
    pub fn body_len(&self) -> usize {
        self.frame_len.saturating_sub(5) as usize
    }
}

/// Writer-side: emits one descriptor's request packets, one per call, in
/// order. Runs on the writer task, so it's handed the live transport
/// directly rather than building a frame and handing it back.
pub(crate) trait Pump: Send {
    fn write_next<'a>(
        &'a mut self,
        seq: u32,
        id: u32,
        transport: &'a mut (dyn AsyncWrite + Unpin + Send),
    ) -> BoxFuture<'a, Result<(), Error>>;
}

/// Reader-side: consumes one descriptor's response packets, one per call, in
/// the order their ids were reserved.
///
/// `body` is `Some` whenever the reader already buffered the payload --
/// always true for an auto-respond descriptor, and true even in
/// manual-respond mode when the server answers with `STATUS` instead of the
/// expected bulk type. It is `None` only for the manual-respond case
/// receiving its expected bulk packet, in which case `handle` must read
/// exactly `header.body_len()` bytes from `transport` itself; anything it
/// leaves unread is drained by the caller afterwards.
pub(crate) trait ResponseHandler: Send {
    fn handle<'a>(
        &'a mut self,
        seq: u32,
        header: FrameHeader,
        body: Option<Message>,
        transport: &'a mut (dyn AsyncRead + Unpin + Send),
    ) -> BoxFuture<'a, Result<(), Error>>;

    /// Called exactly once by the connection: `Ok(())` once every expected
    /// packet has been handled successfully, `Err` the first time this
    /// descriptor is abandoned (a `handle` error, a protocol violation, or
    /// the connection dying mid-flight).
    fn finish(&mut self, result: Result<(), Error>);
}

/// A complete request: `expect_pkts` responses are expected; `auto_respond`
/// selects whether the reader buffers each one into a [`Message`] before
/// calling `handler`, versus handing bulk-data responses to the handler to
/// stream directly off the transport.
pub(crate) struct Descriptor {
    pub expect_pkts: u32,
    pub auto_respond: bool,
    pub pump: Box<dyn Pump>,
    pub handler: Box<dyn ResponseHandler>,
}

/// [`Pump`]/[`ResponseHandler`] pair for the common case: one request packet,
/// one response packet, buffered. `Connection::request` builds every simple
/// control op (`STAT`, `OPEN`, `CLOSE`, ...) as one of these.
pub(crate) struct SinglePump(pub Option<Message>);

impl Pump for SinglePump {
    fn write_next<'a>(
        &'a mut self,
        _seq: u32,
        id: u32,
        transport: &'a mut (dyn AsyncWrite + Unpin + Send),
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;

            let message = self
                .0
                .take()
                .expect("SinglePump::write_next called more than once");
            let frame = message.encode(id)?;
            transport.write_all(&frame).await.map_err(Error::Io)
        })
    }
}

pub(crate) struct SingleOpHandler {
    pub reply: Option<tokio::sync::oneshot::Sender<Result<Message, Error>>>,
}

impl ResponseHandler for SingleOpHandler {
    fn handle<'a>(
        &'a mut self,
        _seq: u32,
        _header: FrameHeader,
        body: Option<Message>,
        _transport: &'a mut (dyn AsyncRead + Unpin + Send),
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let message = body.ok_or(Error::UnexpectedResponse)?;
            if let Some(reply) = self.reply.take() {
                let _ = reply.send(Ok(message));
            }
            Ok(())
        })
    }

    fn finish(&mut self, result: Result<(), Error>) {
        if let Err(err) = result {
            if let Some(reply) = self.reply.take() {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Owned destination for a chunked `ReadAt`: every chunk's manual-respond
/// handler invocation writes its slice of `buf` directly as the bytes come
/// off the transport, so the only copy left is the final hand-off into the
/// caller's own `&mut [u8]` once the descriptor completes (unavoidable here
/// since the descriptor has to be `'static` to cross into the long-lived
/// reader task -- see `DESIGN.md`).
pub(crate) struct ReadAtState {
    pub buf: Vec<u8>,
    pub eof_at: Option<u32>,
    pub filled: usize,
}

pub(crate) struct ReadAtHandler {
    /// (offset into `state.buf`, requested length) per sequence number.
    pub plan: Vec<(usize, usize)>,
    pub state: std::sync::Arc<std::sync::Mutex<ReadAtState>>,
    pub done: Option<tokio::sync::oneshot::Sender<Result<usize, Error>>>,
    /// Next sequence number this descriptor is willing to accept. The reader
    /// task calls `handle` fully sequentially (one frame at a time, each
    /// `.await`ed to completion before the next is read), so a plain field
    /// here is enough -- no other call can be in flight concurrently.
    pub next_seq: u32,
}

impl ResponseHandler for ReadAtHandler {
    fn handle<'a>(
        &'a mut self,
        seq: u32,
        header: FrameHeader,
        body: Option<Message>,
        transport: &'a mut (dyn AsyncRead + Unpin + Send),
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            use tokio::io::AsyncReadExt;

            // The server must echo responses in the order the requests for
            // this descriptor were sent; a lower seq arriving after a higher
            // one is a protocol violation, not something to silently reorder.
            if seq != self.next_seq {
                if body.is_none() {
                    let mut discard = vec![0u8; header.body_len()];
                    let _ = transport.read_exact(&mut discard).await;
                }
                return Err(Error::UnexpectedResponse);
            }
            self.next_seq += 1;

            let (offset, expected_len) = self.plan[seq as usize];

            match body {
                Some(Message::Status(status)) => {
                    let mut state = self.state.lock().unwrap();
                    if status.is_eof() {
                        if state.eof_at.is_none() {
                            state.eof_at = Some(seq);
                        }
                        Ok(())
                    } else {
                        Err(status.into())
                    }
                }
                Some(_) => Err(Error::UnexpectedResponse),
                None => {
                    // Manual-respond DATA: the reader already consumed type+id;
                    // the string length prefix and payload are still ours to read.
                    let mut len_buf = [0u8; 4];
                    transport.read_exact(&mut len_buf).await.map_err(Error::Io)?;
                    let data_len = u32::from_be_bytes(len_buf) as usize;

                    // `header.body_len()` is the frame's own declared size
                    // (type+id already consumed by the reader); after removing
                    // this 4-byte length prefix, whatever remains is the only
                    // byte count that keeps the transport in sync. Trusting
                    // `data_len` instead, if it disagreed, would under- or
                    // over-consume the frame and desync every frame after it.
                    let frame_data_len = header.body_len().saturating_sub(4);
                    if data_len != frame_data_len {
                        let mut discard = vec![0u8; frame_data_len];
                        let _ = transport.read_exact(&mut discard).await;
                        return Err(Error::MissingData);
                    }

                    let already_eof = {
                        let state = self.state.lock().unwrap();
                        state.eof_at.map_or(false, |eof_seq| seq >= eof_seq)
                    };

                    if data_len > expected_len {
                        let mut discard = vec![0u8; data_len];
                        let _ = transport.read_exact(&mut discard).await;
                        return Err(Error::MissingData);
                    }

                    // Read into a scratch buffer first -- a `std::sync::MutexGuard`
                    // held across this `.await` would make the future non-`Send`.
                    let mut chunk = vec![0u8; data_len];
                    transport.read_exact(&mut chunk).await.map_err(Error::Io)?;

                    if already_eof {
                        if data_len != 0 {
                            return Err(Error::MissingData);
                        }
                        return Ok(());
                    }

                    let mut state = self.state.lock().unwrap();
                    state.buf[offset..offset + data_len].copy_from_slice(&chunk);
                    state.filled += data_len;
                    if data_len < expected_len {
                        state.eof_at = Some(seq);
                    }
                    Ok(())
                }
            }
        })
    }

    fn finish(&mut self, result: Result<(), Error>) {
        if let Some(done) = self.done.take() {
            let outcome = result.map(|()| self.state.lock().unwrap().filled);
            let _ = done.send(outcome);
        }
    }
}

/// Emits `READ` request packets for a chunked `ReadAt`.
pub(crate) struct ReadPump {
    pub handle: crate::message::Handle,
    /// (offset, length) per sequence number.
    pub plan: Vec<(u64, u32)>,
}

impl Pump for ReadPump {
    fn write_next<'a>(
        &'a mut self,
        seq: u32,
        id: u32,
        transport: &'a mut (dyn AsyncWrite + Unpin + Send),
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;

            let (offset, length) = self.plan[seq as usize];
            let message = Message::Read(crate::message::Read {
                handle: self.handle.clone(),
                offset,
                length,
            });
            let frame = message.encode(id)?;
            transport.write_all(&frame).await.map_err(Error::Io)
        })
    }
}

/// Emits `WRITE` request packets for a chunked `WriteAt`. Sends the
/// length-prefixed header (up to and including the data-length field) as one
/// transport write and the chunk's bytes as a second, separate write -- the
/// caller's buffer is sliced with `Bytes::slice` (refcounted, no copy) rather
/// than appended into the header's own scratch buffer.
pub(crate) struct WriteAtPump {
    pub handle: crate::message::Handle,
    pub data: Bytes,
    pub chunk_size: usize,
    pub base_offset: u64,
}

impl Pump for WriteAtPump {
    fn write_next<'a>(
        &'a mut self,
        seq: u32,
        id: u32,
        transport: &'a mut (dyn AsyncWrite + Unpin + Send),
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            use crate::encode::SftpEncode;
            use tokio::io::AsyncWriteExt;

            let start = seq as usize * self.chunk_size;
            let end = std::cmp::min(start + self.chunk_size, self.data.len());
            let chunk = self.data.slice(start..end);
            let offset = self.base_offset + start as u64;

            let mut header = Vec::with_capacity(32);
            0u32.encode(&mut header)?; // frame length placeholder, patched below
            6u8.encode(&mut header)?; // SSH_FXP_WRITE
            id.encode(&mut header)?;
            (&self.handle).encode(&mut header)?;
            offset.encode(&mut header)?;
            (chunk.len() as u32).encode(&mut header)?;

            let frame_len = (header.len() - 4 + chunk.len()) as u32;
            header[..4].copy_from_slice(&frame_len.to_be_bytes());

            transport.write_all(&header).await.map_err(Error::Io)?;
            transport.write_all(&chunk).await.map_err(Error::Io)
        })
    }
}

pub(crate) struct WriteAtHandler {
    pub total_len: usize,
    pub done: Option<tokio::sync::oneshot::Sender<Result<usize, Error>>>,
}

impl ResponseHandler for WriteAtHandler {
    fn handle<'a>(
        &'a mut self,
        _seq: u32,
        _header: FrameHeader,
        body: Option<Message>,
        _transport: &'a mut (dyn AsyncRead + Unpin + Send),
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            match body {
                Some(Message::Status(status)) => status.to_result(()).map_err(Error::from),
                _ => Err(Error::UnexpectedResponse),
            }
        })
    }

    fn finish(&mut self, result: Result<(), Error>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result.map(|()| self.total_len));
        }
    }
}
