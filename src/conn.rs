use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{error, trace, warn, Instrument};

use crate::config::{ClientConfig, ErrorHook};
use crate::descriptor::{
    Descriptor, FrameHeader, Pump, ResponseHandler, SingleOpHandler, SinglePump,
};
use crate::error::Error;
use crate::message::{Init, Message, Version, STATUS_KIND};

/// Highest request id handed out before the writer resets the counter back to 1,
/// keeping ids contiguous for the life of the connection instead of wrapping through
/// the high bit some servers treat as reserved.
const ID_WRAP_AT: u32 = 0x7FFF_FFFF;

/// Slack added on top of `max_packet` when bounding an incoming frame.
/// `max_packet` caps the *data* length of a `READ`/`WRITE` payload; every
/// frame also carries a handle, an id, and a handful of length prefixes, and
/// control frames (`VERSION`, `NAME`, `STATUS`) are sized by their own
/// content rather than by `max_packet` at all. The slack keeps the ceiling a
/// guard against a corrupt or hostile length prefix instead of a second,
/// stricter copy of the data-length cap.
const FRAME_OVERHEAD: u32 = 4096;

/// Shared bookkeeping for one in-flight [`Descriptor`], reachable from every
/// id in its reserved range. `remaining` counts down to zero as responses
/// land; `done` guards against invoking `handler.finish` more than once
/// (a late duplicate after an error, or after the last packet already
/// finished it).
struct DescriptorRuntime {
    remaining: AtomicU32,
    auto_respond: bool,
    done: AtomicBool,
    handler: AsyncMutex<Box<dyn ResponseHandler>>,
}

/// What the writer hands to the reader for one descriptor, before writing a
/// single byte of its packets: the id range it reserved and the shared
/// runtime both sides will use to track it.
struct PendingDescriptor {
    base_id: u32,
    count: u32,
    runtime: Arc<DescriptorRuntime>,
}

/// Owns the writer and reader halves of an opaque transport and multiplexes SFTP
/// requests/responses across it by request id. Cloning a `Connection` shares the
/// same underlying writer/reader task pair; every clone can submit requests
/// concurrently, which is how pipelined multi-packet I/O is achieved.
#[derive(Clone)]
pub(crate) struct Connection {
    commands: mpsc::Sender<Descriptor>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    /// Performs the SFTP `INIT`/`VERSION` handshake over `io`, then spawns the
    /// writer and reader tasks that own the split transport for the rest of the
    /// connection's life.
    pub(crate) async fn connect<T>(
        io: T,
        config: ClientConfig,
        on_error: Option<ErrorHook>,
    ) -> Result<(Self, Version), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(io);

        let init = Message::Init(Init {
            version: 3,
            extensions: Default::default(),
        });
        let frame = init.encode(0)?;
        write_half.write_all(&frame).await.map_err(Error::Io)?;

        let frame = read_frame(&mut read_half, config.max_packet())
            .await
            .map_err(Error::Io)?;
        let mut slice = &frame[..];
        let (_, message) = Message::decode(&mut slice)?;

        let version = match message {
            Message::Version(version) if version.version == 3 => version,
            Message::Version(_) => {
                return Err(Error::Unsupported("server does not speak SFTP version 3"))
            }
            Message::Status(status) => return Err(status.into()),
            _ => return Err(Error::UnexpectedResponse),
        };

        let (commands_tx, commands_rx) = mpsc::channel(config.writer_queue_depth);
        let (to_reader_tx, to_reader_rx) = mpsc::channel(config.writer_queue_depth);
        let closed = Arc::new(AtomicBool::new(false));
        let max_packet = config.max_packet();

        // Both tasks can independently discover the connection is terminally
        // dead (a write failing vs. a read failing); whichever notices first
        // flips `error_reported` and fires the hook, so a caller never sees
        // it invoked twice for one failure.
        let error_reported = Arc::new(AtomicBool::new(false));

        tokio::spawn(
            writer_task(
                write_half,
                commands_rx,
                to_reader_tx,
                on_error.clone(),
                closed.clone(),
                error_reported.clone(),
            )
            .instrument(tracing::info_span!("sftp-writer")),
        );
        tokio::spawn(
            reader_task(
                read_half,
                to_reader_rx,
                max_packet,
                on_error,
                closed.clone(),
                error_reported,
            )
            .instrument(tracing::info_span!("sftp-reader")),
        );

        Ok((
            Self {
                commands: commands_tx,
                closed,
            },
            version,
        ))
    }

    /// Sends one request and awaits its matching response. Safe to call
    /// concurrently from many tasks/handles sharing this connection: each call
    /// gets its own request id and the writer never blocks a request on a prior
    /// one's reply.
    pub(crate) async fn request(&self, message: Message) -> Result<Message, Error> {
        let (reply, response) = oneshot::channel();
        self.submit_request(message, reply).await?;
        response.await.map_err(|_| Error::ConnectionLost)?
    }

    /// Like [`Connection::request`], but lets the caller keep several such
    /// requests in flight at once (e.g. `File::write_from_sized`'s pipelined
    /// window) instead of awaiting the response here. Returns once the
    /// one-packet descriptor has been accepted by the writer queue.
    pub(crate) async fn submit_request(
        &self,
        message: Message,
        reply: oneshot::Sender<Result<Message, Error>>,
    ) -> Result<(), Error> {
        let descriptor = Descriptor {
            expect_pkts: 1,
            auto_respond: true,
            pump: Box::new(SinglePump(Some(message))),
            handler: Box::new(SingleOpHandler { reply: Some(reply) }),
        };
        self.submit(descriptor).await
    }

    /// Enqueues a (possibly multi-packet) descriptor onto the writer task.
    /// Returns once it's accepted; completion is reported through whatever
    /// channel the descriptor's own handler uses (its `finish` callback).
    pub(crate) async fn submit(&self, descriptor: Descriptor) -> Result<(), Error> {
        self.commands
            .send(descriptor)
            .await
            .map_err(|_| Error::ConnectionLost)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the writer task has observed this (and every clone's) sender
    /// side drop, meaning no more requests can be submitted.
    pub(crate) fn closed(&self) -> impl std::future::Future<Output = ()> + '_ {
        self.commands.closed()
    }
}

async fn read_frame<R>(reader: &mut R, max_packet: u32) -> std::io::Result<bytes::BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    let ceiling = max_packet.saturating_add(FRAME_OVERHEAD);

    if len > ceiling {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("server frame of {len} bytes exceeds configured max_packet of {max_packet} (+{FRAME_OVERHEAD} overhead)"),
        ));
    }

    let mut frame = bytes::BytesMut::zeroed(4 + len as usize);
    frame[..4].copy_from_slice(&len_buf);
    reader.read_exact(&mut frame[4..]).await?;
    Ok(frame)
}

/// Reads just the 9-byte prefix (length, type, id) of the next frame, bounding
/// the declared length against `max_packet` the same way [`read_frame`] does.
async fn read_header<R>(reader: &mut R, max_packet: u32) -> std::io::Result<FrameHeader>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; 9];
    reader.read_exact(&mut raw).await?;
    let mut slice = &raw[..];
    let (frame_len, kind, id) =
        Message::decode_header(&mut slice).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed frame header")
        })?;

    let ceiling = max_packet.saturating_add(FRAME_OVERHEAD);
    if frame_len > ceiling || frame_len < 5 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("server frame of {frame_len} bytes is out of bounds (max_packet={max_packet})"),
        ));
    }

    Ok(FrameHeader {
        frame_len,
        kind,
        id,
    })
}

/// Invokes `on_error` at most once across both tasks' lifetimes: whichever
/// side notices the transport is dead first wins the report.
fn report_once(on_error: &Option<ErrorHook>, reported: &AtomicBool, err: &Error) {
    if reported.swap(true, Ordering::AcqRel) {
        return;
    }
    if let Some(hook) = on_error {
        hook(err);
    }
}

/// Reserves `count` contiguous ids for one descriptor, never letting a
/// descriptor's range straddle the wraparound point.
fn reserve_ids(next_id: &mut u32, count: u32) -> u32 {
    if *next_id >= ID_WRAP_AT || next_id.saturating_add(count) > ID_WRAP_AT {
        *next_id = 0;
    }
    let base = *next_id + 1;
    *next_id += count;
    base
}

async fn writer_task<W>(
    mut write_half: W,
    mut commands: mpsc::Receiver<Descriptor>,
    to_reader: mpsc::Sender<PendingDescriptor>,
    on_error: Option<ErrorHook>,
    closed: Arc<AtomicBool>,
    error_reported: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut next_id: u32 = 0;

    'outer: while let Some(descriptor) = commands.recv().await {
        let Descriptor {
            expect_pkts,
            auto_respond,
            mut pump,
            handler,
        } = descriptor;

        if expect_pkts == 0 {
            let mut handler = handler;
            handler.finish(Err(Error::InvalidArgument(
                "descriptor with zero expected response packets",
            )));
            continue;
        }

        let base_id = reserve_ids(&mut next_id, expect_pkts);
        let runtime = Arc::new(DescriptorRuntime {
            remaining: AtomicU32::new(expect_pkts),
            auto_respond,
            done: AtomicBool::new(false),
            handler: AsyncMutex::new(handler),
        });

        // Hand the descriptor to the reader's tracking queue *before* writing
        // any of its bytes, so a reply racing in can never arrive before
        // we're ready to correlate it.
        if to_reader
            .send(PendingDescriptor {
                base_id,
                count: expect_pkts,
                runtime: runtime.clone(),
            })
            .await
            .is_err()
        {
            finish_runtime(&runtime, Error::ConnectionLost).await;
            closed.store(true, Ordering::Release);
            break;
        }

        // Pump every packet of this descriptor back-to-back: no other queued
        // descriptor's bytes can land on the wire until this loop finishes.
        for seq in 0..expect_pkts {
            let id = base_id + seq;
            if let Err(err) = pump.write_next(seq, id, &mut write_half).await {
                warn!(id, error = %err, "sftp writer: transport write failed, shutting down");
                finish_runtime(&runtime, Error::ConnectionLost).await;
                closed.store(true, Ordering::Release);
                report_once(&on_error, &error_reported, &err);
                break 'outer;
            }
            trace!(id, seq, "sftp writer: request packet sent");
        }
    }

    commands.close();
    while let Some(descriptor) = commands.recv().await {
        let mut handler = descriptor.handler;
        handler.finish(Err(Error::ConnectionLost));
    }
}

async fn finish_runtime(runtime: &Arc<DescriptorRuntime>, err: Error) {
    if !runtime.done.swap(true, Ordering::AcqRel) {
        let mut handler = runtime.handler.lock().await;
        handler.finish(Err(err));
    }
}

fn insert_pending(
    map: &mut HashMap<u32, (u32, Arc<DescriptorRuntime>)>,
    pd: PendingDescriptor,
) {
    for seq in 0..pd.count {
        map.insert(pd.base_id + seq, (seq, pd.runtime.clone()));
    }
}

/// Looks up `id`'s descriptor, draining newly arrived registrations from
/// `to_reader` into `map` until it's found. A registration is guaranteed to
/// have been sent before its packets' bytes, so a miss after the channel
/// itself closes means the server replied with an id we never issued.
async fn find_pending(
    map: &mut HashMap<u32, (u32, Arc<DescriptorRuntime>)>,
    to_reader: &mut mpsc::Receiver<PendingDescriptor>,
    id: u32,
) -> Option<(u32, Arc<DescriptorRuntime>)> {
    if let Some(entry) = map.remove(&id) {
        return Some(entry);
    }
    while let Some(pd) = to_reader.recv().await {
        insert_pending(map, pd);
        if let Some(entry) = map.remove(&id) {
            return Some(entry);
        }
    }
    None
}

async fn reader_task<R>(
    mut read_half: R,
    mut to_reader: mpsc::Receiver<PendingDescriptor>,
    max_packet: u32,
    on_error: Option<ErrorHook>,
    closed: Arc<AtomicBool>,
    error_reported: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut map: HashMap<u32, (u32, Arc<DescriptorRuntime>)> = HashMap::new();
    let mut scratch = bytes::BytesMut::new();

    'outer: loop {
        let header = match read_header(&mut read_half, max_packet).await {
            Ok(header) => header,
            Err(io_err) => {
                let err = Error::Io(io_err);
                warn!(error = %err, "sftp reader: transport closed, shutting down");
                report_once(&on_error, &error_reported, &err);
                break;
            }
        };

        let Some((seq, runtime)) = find_pending(&mut map, &mut to_reader, header.id).await else {
            let err = Error::UnexpectedResponse;
            error!(id = header.id, "sftp reader: reply for an id we never issued");
            report_once(&on_error, &error_reported, &err);
            break;
        };

        if runtime.done.load(Ordering::Acquire) {
            // Stale duplicate: this descriptor already finished (an earlier
            // packet errored). Drain its bytes and move on.
            let mut discard = vec![0u8; header.body_len()];
            if read_half.read_exact(&mut discard).await.is_err() {
                break;
            }
            continue;
        }

        let buffer_first = runtime.auto_respond || header.kind == STATUS_KIND;
        let body = if buffer_first {
            match read_body(&mut read_half, &header, &mut scratch).await {
                Ok(message) => Some(message),
                Err(err) => {
                    error!(error = %err, "sftp reader: malformed frame from server");
                    finish_runtime(&runtime, Error::ConnectionLost).await;
                    report_once(&on_error, &error_reported, &err);
                    break;
                }
            }
        } else {
            None
        };

        let mut handler = runtime.handler.lock().await;
        let result = if body.is_some() {
            handler
                .handle(seq, header, body, &mut tokio::io::empty())
                .await
        } else {
            let mut counting = CountingReader::new(&mut read_half);
            let result = handler.handle(seq, header, None, &mut counting).await;
            let consumed = counting.count;
            drop(counting);

            if result.is_ok() {
                let leftover = header.body_len().saturating_sub(consumed);
                if leftover > 0 {
                    let mut discard = vec![0u8; leftover];
                    if let Err(io_err) = read_half.read_exact(&mut discard).await {
                        drop(handler);
                        let err = Error::Io(io_err);
                        finish_runtime(&runtime, Error::ConnectionLost).await;
                        report_once(&on_error, &error_reported, &err);
                        break 'outer;
                    }
                }
            }
            result
        };

        match result {
            Ok(()) => {
                let left = runtime.remaining.fetch_sub(1, Ordering::AcqRel) - 1;
                if left == 0 && !runtime.done.swap(true, Ordering::AcqRel) {
                    handler.finish(Ok(()));
                }
            }
            Err(err) => {
                if !runtime.done.swap(true, Ordering::AcqRel) {
                    handler.finish(Err(err));
                }
            }
        }
        drop(handler);
    }

    closed.store(true, Ordering::Release);
    to_reader.close();

    for (_, runtime) in map.drain() {
        finish_runtime(&runtime, Error::ConnectionLost).await;
    }
    while let Some(pd) = to_reader.recv().await {
        finish_runtime(&pd.runtime, Error::ConnectionLost).await;
    }
}

/// Reads a frame's already-known-length body into a reusable scratch buffer
/// and decodes it into a typed [`Message`] -- the "auto-respond" path, also
/// taken for any `STATUS` regardless of the descriptor's respond mode.
async fn read_body<R>(
    read_half: &mut R,
    header: &FrameHeader,
    scratch: &mut bytes::BytesMut,
) -> Result<Message, Error>
where
    R: AsyncRead + Unpin,
{
    let len = header.body_len();
    scratch.resize(len, 0);
    read_half
        .read_exact(&mut scratch[..len])
        .await
        .map_err(Error::Io)?;
    let mut slice = &scratch[..len];
    let (_, message) = Message::decode_payload(header.kind, header.id, &mut slice)?;
    Ok(message)
}

/// Wraps a transport to count bytes actually read through it, so the reader
/// can tell how much of a manual-respond handler's declared body a handler
/// consumed and drain whatever it left behind.
struct CountingReader<'a, R> {
    inner: &'a mut R,
    count: usize,
}

impl<'a, R> CountingReader<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        Self { inner, count: 0 }
    }
}

impl<'a, R: AsyncRead + Unpin> AsyncRead for CountingReader<'a, R> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let inner = std::pin::Pin::new(&mut *self.inner);
        let poll = inner.poll_read(cx, buf);
        if poll.is_ready() {
            self.count += buf.filled().len() - before;
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// §8 invariant 1: every descriptor gets a contiguous `b..b+n-1` id
    /// block, and consecutive reservations never overlap.
    #[test]
    fn reserve_ids_is_contiguous_and_non_overlapping() {
        let mut next_id = 0u32;

        let first = reserve_ids(&mut next_id, 3);
        assert_eq!(first, 1);
        assert_eq!(next_id, 3);

        let second = reserve_ids(&mut next_id, 1);
        assert_eq!(second, 4);
        assert_eq!(next_id, 4);

        let third = reserve_ids(&mut next_id, 5);
        assert_eq!(third, 5);
        assert_eq!(next_id, 9);

        // No id handed out by any reservation repeats.
        let mut seen = std::collections::HashSet::new();
        for (base, count) in [(first, 3u32), (second, 1), (third, 5)] {
            for id in base..base + count {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
    }

    /// A reservation that would straddle [`ID_WRAP_AT`] resets to the start
    /// of the space instead, so no descriptor's block ever wraps mid-range.
    #[test]
    fn reserve_ids_resets_before_straddling_the_wrap() {
        let mut next_id = ID_WRAP_AT - 2;

        let base = reserve_ids(&mut next_id, 5);
        assert_eq!(base, 1, "should have reset to the start of the id space");
        assert_eq!(next_id, 5);
    }

    /// Already sitting at or past the wrap point also resets rather than
    /// reserving ids beyond it.
    #[test]
    fn reserve_ids_resets_once_past_the_wrap_point() {
        let mut next_id = ID_WRAP_AT;

        let base = reserve_ids(&mut next_id, 1);
        assert_eq!(base, 1);
        assert_eq!(next_id, 1);
    }

    #[tokio::test]
    async fn handshake_then_roundtrip() {
        let (client_io, mut server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let frame = read_frame(&mut server_io, 32768).await.unwrap();
            let mut slice = &frame[..];
            let (_, message) = Message::decode(&mut slice).unwrap();
            assert!(matches!(message, Message::Init(_)));

            let version = Message::Version(Version {
                version: 3,
                extensions: Default::default(),
            });
            let reply = version.encode(0).unwrap();
            server_io.write_all(&reply).await.unwrap();

            let frame = read_frame(&mut server_io, 32768).await.unwrap();
            let mut slice = &frame[..];
            let (id, message) = Message::decode(&mut slice).unwrap();
            assert!(matches!(message, Message::RealPath(_)));

            let reply = Message::Name(vec![]).encode(id).unwrap();
            server_io.write_all(&reply).await.unwrap();
        });

        let (conn, version) = Connection::connect(client_io, ClientConfig::default(), None)
            .await
            .unwrap();
        assert_eq!(version.version, 3);

        let request = Message::RealPath(bytes::Bytes::from_static(b"."));
        let response = conn.request(request).await.unwrap();
        assert!(matches!(response, Message::Name(_)));

        server.await.unwrap();
    }
}
