use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{BcpError, CodecError, TransportError};
use crate::packets::{ConnectionHead, Packet};

/// Anything a BCP stream can run over. Blanket-implemented, so `TcpStream`,
///  `tokio::io::duplex` halves etc. qualify as-is.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedByteStream = Box<dyn ByteStream>;

/// This is an abstraction for enqueueing frames on one stream's write queue, introduced
///  to facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketWriter: Send + Sync + 'static {
    /// Enqueue a frame for writing. Suspends on backpressure and fails once the writer
    ///  task has died - the caller treats that as the stream being lost.
    async fn send_packet(&self, packet: Packet) -> anyhow::Result<()>;

    /// Flush everything enqueued so far, then close the underlying stream.
    async fn close(&self);
}

enum WriteCommand {
    Packet(Packet),
    Close,
}

/// Write side of one stream: owns a writer task that serializes frames, enforces the
///  writing timeout, and emits a `HeartBeat` whenever the stream had nothing to send
///  for the configured delay.
pub(crate) struct StreamWriteQueue {
    tx: mpsc::Sender<WriteCommand>,
    task: JoinHandle<()>,
}

impl StreamWriteQueue {
    const QUEUE_CAPACITY: usize = 64;

    pub fn spawn<W: AsyncWrite + Send + Unpin + 'static>(
        write_half: W,
        head: Option<ConnectionHead>,
        heart_beat_delay: Duration,
        writing_timeout: Duration,
    ) -> StreamWriteQueue {
        let (tx, rx) = mpsc::channel(Self::QUEUE_CAPACITY);
        let task = tokio::spawn(Self::write_loop(write_half, head, heart_beat_delay, writing_timeout, rx));
        StreamWriteQueue { tx, task }
    }

    async fn write_loop<W: AsyncWrite + Send + Unpin>(
        mut write_half: W,
        head: Option<ConnectionHead>,
        heart_beat_delay: Duration,
        writing_timeout: Duration,
        mut rx: mpsc::Receiver<WriteCommand>,
    ) {
        let mut write_buf = BytesMut::new();

        if let Some(head) = head {
            head.ser(&mut write_buf);
            if !Self::write_all(&mut write_half, &mut write_buf, writing_timeout).await {
                return;
            }
        }

        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(WriteCommand::Packet(packet)) => {
                            trace!("writing {:?}", packet);
                            packet.ser(&mut write_buf);
                            if !Self::write_all(&mut write_half, &mut write_buf, writing_timeout).await {
                                return;
                            }
                        }
                        Some(WriteCommand::Close) | None => {
                            let _ = write_half.shutdown().await;
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep(heart_beat_delay) => {
                    trace!("stream is send-idle - writing heartbeat");
                    Packet::HeartBeat.ser(&mut write_buf);
                    if !Self::write_all(&mut write_half, &mut write_buf, writing_timeout).await {
                        return;
                    }
                }
            }
        }
    }

    /// true iff the buffer was written completely; the buffer is cleared either way
    async fn write_all<W: AsyncWrite + Send + Unpin>(
        write_half: &mut W,
        buf: &mut BytesMut,
        writing_timeout: Duration,
    ) -> bool {
        let result = timeout(writing_timeout, async {
            write_half.write_all(buf).await?;
            write_half.flush().await
        })
        .await;

        buf.clear();
        match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("error writing to stream - shutting down its write queue: {}", e);
                false
            }
            Err(_) => {
                debug!("writing to stream timed out - shutting down its write queue");
                false
            }
        }
    }
}

#[async_trait]
impl PacketWriter for StreamWriteQueue {
    async fn send_packet(&self, packet: Packet) -> anyhow::Result<()> {
        self.tx.send(WriteCommand::Packet(packet)).await
            .map_err(|_| anyhow!(TransportError::WriterClosed))
    }

    async fn close(&self) {
        // a full queue means the peer stopped draining - no point in flushing politely
        if self.tx.try_send(WriteCommand::Close).is_err() {
            self.task.abort();
        }
    }
}

/// Read side of one stream: buffers raw bytes and decodes one self-delimiting frame at
///  a time, enforcing the reading timeout per fill.
pub(crate) struct FrameReader<R> {
    read_half: R,
    buf: BytesMut,
    max_data_size: u32,
    reading_timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(read_half: R, max_data_size: u32, reading_timeout: Duration) -> FrameReader<R> {
        FrameReader {
            read_half,
            buf: BytesMut::with_capacity(4096),
            max_data_size,
            reading_timeout,
        }
    }

    pub async fn next_packet(&mut self) -> Result<Packet, BcpError> {
        loop {
            if !self.buf.is_empty() {
                let mut slice: &[u8] = &self.buf;
                match Packet::deser(&mut slice, self.max_data_size) {
                    Ok(packet) => {
                        let consumed = self.buf.len() - slice.len();
                        self.buf.advance(consumed);
                        return Ok(packet);
                    }
                    Err(CodecError::Truncated) => {
                        // frame continues beyond the buffered bytes
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            self.fill().await?;
        }
    }

    /// the handshake frame at the start of a freshly accepted stream
    pub async fn read_connection_head(&mut self) -> Result<ConnectionHead, BcpError> {
        loop {
            if !self.buf.is_empty() {
                let mut slice: &[u8] = &self.buf;
                match ConnectionHead::deser(&mut slice) {
                    Ok(head) => {
                        let consumed = self.buf.len() - slice.len();
                        self.buf.advance(consumed);
                        return Ok(head);
                    }
                    Err(CodecError::Truncated) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<(), BcpError> {
        match timeout(self.reading_timeout, self.read_half.read_buf(&mut self.buf)).await {
            Err(_) => Err(TransportError::ReadTimeout.into()),
            Ok(Err(e)) => Err(TransportError::Io(e).into()),
            Ok(Ok(0)) => Err(TransportError::Closed.into()),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::{ConnectionId, PacketId, SessionId};
    use bytes::Bytes;
    use tokio::io::duplex;

    fn reader<R: AsyncRead + Unpin>(read_half: R) -> FrameReader<R> {
        FrameReader::new(read_half, 1024, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_reads_consecutive_frames() {
        let (mut local, remote) = duplex(1024);
        let mut frame_reader = reader(remote);

        let packets = vec![
            Packet::Data { buffers: vec![Bytes::from_static(b"hi")] },
            Packet::Acknowledge,
            Packet::RetransmissionFinish { connection_id: ConnectionId::from_raw(1), packet_id: PacketId::ZERO },
        ];
        let mut wire = BytesMut::new();
        for p in &packets {
            p.ser(&mut wire);
        }
        local.write_all(&wire).await.unwrap();

        for expected in packets {
            assert_eq!(frame_reader.next_packet().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_reassembles_frame_split_across_writes() {
        let (mut local, remote) = duplex(1024);
        let mut frame_reader = reader(remote);

        let packet = Packet::Data { buffers: vec![Bytes::from_static(b"split me")] };
        let mut wire = BytesMut::new();
        packet.ser(&mut wire);

        let handle = tokio::spawn(async move {
            for chunk in wire.chunks(3) {
                local.write_all(chunk).await.unwrap();
                local.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            local
        });

        assert_eq!(frame_reader.next_packet().await.unwrap(), packet);
        drop(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_peer_close_is_a_transport_error() {
        let (local, remote) = duplex(1024);
        let mut frame_reader = reader(remote);
        drop(local);

        assert!(matches!(
            frame_reader.next_packet().await,
            Err(BcpError::Transport(TransportError::Closed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_a_read_timeout() {
        let (_local, remote) = duplex(1024);
        let mut frame_reader = reader(remote);

        assert!(matches!(
            frame_reader.next_packet().await,
            Err(BcpError::Transport(TransportError::ReadTimeout))
        ));
    }

    #[tokio::test]
    async fn test_unknown_head_byte_is_a_codec_error() {
        let (mut local, remote) = duplex(1024);
        let mut frame_reader = reader(remote);
        local.write_all(&[77]).await.unwrap();

        assert!(matches!(
            frame_reader.next_packet().await,
            Err(BcpError::Codec(CodecError::UnknownHeadByte(77)))
        ));
    }

    #[tokio::test]
    async fn test_reads_connection_head_then_frames() {
        let (mut local, remote) = duplex(1024);
        let mut frame_reader = reader(remote);

        let head = ConnectionHead {
            session_id: SessionId::from_bytes([9; 16]),
            is_renew: true,
            connection_id: ConnectionId::from_raw(3),
        };
        let mut wire = BytesMut::new();
        head.ser(&mut wire);
        Packet::Finish.ser(&mut wire);
        local.write_all(&wire).await.unwrap();

        assert_eq!(frame_reader.read_connection_head().await.unwrap(), head);
        assert_eq!(frame_reader.next_packet().await.unwrap(), Packet::Finish);
    }

    #[tokio::test]
    async fn test_write_queue_writes_head_then_packets() {
        let (local, remote) = duplex(1024);
        let head = ConnectionHead {
            session_id: SessionId::from_bytes([1; 16]),
            is_renew: false,
            connection_id: ConnectionId::from_raw(7),
        };

        let queue = StreamWriteQueue::spawn(local, Some(head), Duration::from_secs(60), Duration::from_secs(5));
        queue.send_packet(Packet::Acknowledge).await.unwrap();

        let mut frame_reader = reader(remote);
        assert_eq!(frame_reader.read_connection_head().await.unwrap(), head);
        assert_eq!(frame_reader.next_packet().await.unwrap(), Packet::Acknowledge);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_queue_emits_heartbeats_while_idle() {
        let (local, remote) = duplex(1024);
        let queue = StreamWriteQueue::spawn(local, None, Duration::from_secs(3), Duration::from_secs(5));

        let mut frame_reader = FrameReader::new(remote, 1024, Duration::from_secs(10));
        assert_eq!(frame_reader.next_packet().await.unwrap(), Packet::HeartBeat);
        assert_eq!(frame_reader.next_packet().await.unwrap(), Packet::HeartBeat);

        queue.close().await;
    }

    #[tokio::test]
    async fn test_close_ends_the_stream() {
        let (local, remote) = duplex(1024);
        let queue = StreamWriteQueue::spawn(local, None, Duration::from_secs(60), Duration::from_secs(5));

        queue.send_packet(Packet::ShutDown).await.unwrap();
        queue.close().await;

        let mut frame_reader = reader(remote);
        assert_eq!(frame_reader.next_packet().await.unwrap(), Packet::ShutDown);
        assert!(matches!(
            frame_reader.next_packet().await,
            Err(BcpError::Transport(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (local, _remote) = duplex(1024);
        let queue = StreamWriteQueue::spawn(local, None, Duration::from_secs(60), Duration::from_secs(5));

        queue.close().await;
        // the writer task drains the close command and exits
        tokio::task::yield_now().await;
        while !queue.task.is_finished() {
            tokio::task::yield_now().await;
        }

        assert!(queue.send_packet(Packet::Acknowledge).await.is_err());
    }
}
