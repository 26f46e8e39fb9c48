use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::config::BcpConfig;
use crate::crypto::{NoCrypto, PayloadCrypto};
use crate::packets::SessionId;
use crate::session::{Role, Session, SessionEvents, SessionShared};
use crate::stream_io::BoxedByteStream;

/// User-provided factory for the underlying streams of a session - typically a thin
///  wrapper around `TcpStream::connect`. Called whenever the session decides to open
///  one more connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> anyhow::Result<BoxedByteStream>;
}

/// Client side of a BCP session.
///
/// The client mints the session id, opens the initial connection, and from then on
///  adapts the connection count: a connection that stays busy past the busy timeout is
///  classified as slow, and once every connection is slow an additional one is opened
///  (up to the configured bound). Surplus idle connections are gracefully finished
///  again after the idle timeout.
pub struct BcpClient {
    session: Session,
}

impl BcpClient {
    /// Mint a fresh session and start connecting. This returns as soon as the first
    ///  connection attempt is under way; `on_available` fires once the session can
    ///  actually reach the server. Messages sent before that are buffered (bounded).
    pub fn start(
        config: BcpConfig,
        connector: Arc<dyn Connector>,
        events: Arc<dyn SessionEvents>,
    ) -> anyhow::Result<BcpClient> {
        Self::start_with_crypto(config, connector, events, Arc::new(NoCrypto))
    }

    pub fn start_with_crypto(
        config: BcpConfig,
        connector: Arc<dyn Connector>,
        events: Arc<dyn SessionEvents>,
        crypto: Arc<dyn PayloadCrypto>,
    ) -> anyhow::Result<BcpClient> {
        config.validate()?;

        let shared = SessionShared::new(
            Arc::new(config),
            SessionId::mint(),
            Role::Client { connector },
            crypto,
        );
        shared.install_events(events);

        let kick_off = shared.clone();
        tokio::spawn(async move { kick_off.kick_off().await });

        Ok(BcpClient {
            session: Session { shared },
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// send one message; see [`Session::send`]
    pub async fn send(&self, buffers: Vec<Bytes>) -> anyhow::Result<()> {
        self.session.send(buffers).await
    }

    pub async fn shut_down(&self) {
        self.session.shut_down().await;
    }

    pub async fn interrupt(&self) {
        self.session.interrupt().await;
    }

    /// Full restart of the session: discard all local per-connection state and
    ///  reconnect with the renew flag set, so the server discards its side as well.
    ///  Unacknowledged and buffered messages are lost.
    pub async fn renew(&self) {
        self.session.shared.kick_off_renew().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Liveness;
    use crate::packets::{ConnectionHead, ConnectionId, Packet};
    use crate::stream_io::FrameReader;
    use anyhow::bail;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::sync::mpsc;

    fn test_config() -> BcpConfig {
        BcpConfig {
            busy_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_millis(300),
            // keep periodic traffic out of the way: these tests steer acks explicitly
            heart_beat_delay: Duration::from_secs(1800),
            reading_timeout: Duration::from_secs(3600),
            writing_timeout: Duration::from_secs(3600),
            ..BcpConfig::default_for(4)
        }
    }

    /// scripted far end: accepts duplex streams, records what arrives, and acks /
    ///  injects frames as the test dictates
    struct TestPeer {
        auto_ack: AtomicBool,
        refuse_connects: AtomicBool,
        streams: StdMutex<Vec<Arc<PeerStream>>>,
    }

    struct PeerStream {
        head: ConnectionHead,
        received: StdMutex<Vec<Packet>>,
        inject: mpsc::UnboundedSender<Packet>,
    }

    impl TestPeer {
        fn new(auto_ack: bool) -> Arc<TestPeer> {
            Arc::new(TestPeer {
                auto_ack: AtomicBool::new(auto_ack),
                refuse_connects: AtomicBool::new(false),
                streams: StdMutex::new(Vec::new()),
            })
        }

        fn num_streams(&self) -> usize {
            self.streams.lock().unwrap().len()
        }

        fn stream(&self, i: usize) -> Arc<PeerStream> {
            self.streams.lock().unwrap()[i].clone()
        }

        fn received_on(&self, i: usize) -> Vec<Packet> {
            self.stream(i).received.lock().unwrap().clone()
        }

        async fn run_stream(self: Arc<Self>, stream: tokio::io::DuplexStream) {
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut frame_reader = FrameReader::new(read_half, 1024 * 1024, Duration::from_secs(3600));

            let Ok(head) = frame_reader.read_connection_head().await else {
                return;
            };
            let (inject, mut injected) = mpsc::unbounded_channel();
            let peer_stream = Arc::new(PeerStream {
                head,
                received: StdMutex::new(Vec::new()),
                inject,
            });
            self.streams.lock().unwrap().push(peer_stream.clone());

            let mut write_buf = BytesMut::new();
            loop {
                tokio::select! {
                    packet = frame_reader.next_packet() => {
                        let Ok(packet) = packet else { return };
                        if packet == Packet::HeartBeat {
                            continue;
                        }
                        let needs_ack = packet.is_acknowledge_required();
                        peer_stream.received.lock().unwrap().push(packet);
                        if needs_ack && self.auto_ack.load(Ordering::SeqCst) {
                            Packet::Acknowledge.ser(&mut write_buf);
                            if write_half.write_all(&write_buf).await.is_err() {
                                return;
                            }
                            write_buf.clear();
                        }
                    }
                    Some(packet) = injected.recv() => {
                        packet.ser(&mut write_buf);
                        if write_half.write_all(&write_buf).await.is_err() {
                            return;
                        }
                        write_buf.clear();
                    }
                }
            }
        }
    }

    struct PeerConnector {
        peer: Arc<TestPeer>,
    }

    #[async_trait]
    impl Connector for PeerConnector {
        async fn connect(&self) -> anyhow::Result<BoxedByteStream> {
            if self.peer.refuse_connects.load(Ordering::SeqCst) {
                bail!("connection refused");
            }
            let (client_end, peer_end) = duplex(64 * 1024);
            tokio::spawn(self.peer.clone().run_stream(peer_end));
            Ok(Box::new(client_end))
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        messages: StdMutex<Vec<Vec<Bytes>>>,
        log: StdMutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl SessionEvents for RecordingEvents {
        async fn on_message(&self, buffers: Vec<Bytes>) {
            self.messages.lock().unwrap().push(buffers);
        }
        async fn on_available(&self) {
            self.log.lock().unwrap().push("available");
        }
        async fn on_unavailable(&self) {
            self.log.lock().unwrap().push("unavailable");
        }
        async fn on_shut_down(&self) {
            self.log.lock().unwrap().push("shut_down");
        }
        async fn on_interrupted(&self) {
            self.log.lock().unwrap().push("interrupted");
        }
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn start_client(peer: &Arc<TestPeer>, events: Arc<RecordingEvents>) -> BcpClient {
        BcpClient::start(
            test_config(),
            Arc::new(PeerConnector { peer: peer.clone() }),
            events,
        )
        .unwrap()
    }

    fn liveness_of(client: &BcpClient, raw_id: u32) -> Option<Liveness> {
        let state = client.session.shared.state.lock().unwrap();
        state.connections.get(&ConnectionId::from_raw(raw_id)).map(|c| c.liveness)
    }

    fn num_connections(client: &BcpClient) -> usize {
        client.session.shared.state.lock().unwrap().connections.len()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sends_handshake() {
        let peer = TestPeer::new(true);
        let events = Arc::new(RecordingEvents::default());
        let client = start_client(&peer, events.clone());

        eventually(|| peer.num_streams() == 1).await;
        let head = peer.stream(0).head;
        assert_eq!(head.session_id, client.session_id());
        assert_eq!(head.connection_id, ConnectionId::from_raw(1));
        assert!(!head.is_renew);

        eventually(|| events.log.lock().unwrap().contains(&"available")).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reaches_peer_and_ack_drains_the_connection() {
        let peer = TestPeer::new(true);
        let client = start_client(&peer, Arc::new(RecordingEvents::default()));

        eventually(|| peer.num_streams() == 1).await;
        client.send(vec![Bytes::from_static(b"hi"), Bytes::from_static(b"there")]).await.unwrap();

        eventually(|| !peer.received_on(0).is_empty()).await;
        assert_eq!(peer.received_on(0), vec![Packet::Data {
            buffers: vec![Bytes::from_static(b"hi"), Bytes::from_static(b"there")],
        }]);

        eventually(|| liveness_of(&client, 1) == Some(Liveness::Idle)).await;
        let state = client.session.shared.state.lock().unwrap();
        let conn = state.connections.get(&ConnectionId::from_raw(1)).unwrap();
        assert!(conn.unconfirmed_packets.is_empty());
        assert_eq!(conn.num_data_sent, 1);
        assert_eq!(conn.num_acknowledge_received_for_data, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_sent_while_unconnected_are_flushed_after_reconnect() {
        let peer = TestPeer::new(true);
        peer.refuse_connects.store(true, Ordering::SeqCst);
        let events = Arc::new(RecordingEvents::default());
        let client = start_client(&peer, events.clone());

        client.send(vec![Bytes::from_static(b"queued")]).await.unwrap();
        assert_eq!(peer.num_streams(), 0);

        // the reconnect timer keeps retrying with the busy-timeout delay
        peer.refuse_connects.store(false, Ordering::SeqCst);
        eventually(|| peer.num_streams() == 1).await;
        eventually(|| !peer.received_on(0).is_empty()).await;
        assert_eq!(peer.received_on(0), vec![Packet::Data {
            buffers: vec![Bytes::from_static(b"queued")],
        }]);

        let log = events.log.lock().unwrap().clone();
        assert_eq!(log.iter().filter(|e| **e == "available").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_connection_escalates_to_slow_and_opens_a_second_one() {
        let peer = TestPeer::new(false); // nothing gets acknowledged
        let client = start_client(&peer, Arc::new(RecordingEvents::default()));

        eventually(|| peer.num_streams() == 1).await;
        client.send(vec![Bytes::from_static(b"m1")]).await.unwrap();

        // busy timeout passes unacknowledged: slow classification, extra connection
        eventually(|| peer.num_streams() == 2).await;
        assert_eq!(liveness_of(&client, 1), Some(Liveness::Slow));
        assert_eq!(peer.stream(1).head.connection_id, ConnectionId::from_raw(2));
        assert!(!peer.stream(1).head.is_renew);
    }

    #[tokio::test(start_paused = true)]
    async fn test_surplus_idle_connection_is_gracefully_finished() {
        let peer = TestPeer::new(false);
        let client = start_client(&peer, Arc::new(RecordingEvents::default()));

        eventually(|| peer.num_streams() == 1).await;
        client.send(vec![Bytes::from_static(b"m1")]).await.unwrap();
        eventually(|| peer.num_streams() == 2).await;

        // the peer finally acknowledges connection 1's data: both connections idle,
        //  which is one more than the session needs
        peer.stream(0).inject.send(Packet::Acknowledge).unwrap();
        eventually(|| liveness_of(&client, 1) == Some(Liveness::Idle)).await;

        // after the idle timeout one idle connection is finished
        eventually(|| peer.received_on(0).contains(&Packet::Finish)).await;

        // the peer confirms the finish and half-closes symmetrically
        peer.stream(0).inject.send(Packet::Acknowledge).unwrap();
        peer.stream(0).inject.send(Packet::Finish).unwrap();

        // fully drained: the record disappears, one connection remains
        eventually(|| num_connections(&client) == 1).await;
        assert_eq!(liveness_of(&client, 2), Some(Liveness::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shut_down_announces_and_cancels_all_timers() {
        let peer = TestPeer::new(false);
        let events = Arc::new(RecordingEvents::default());
        let client = start_client(&peer, events.clone());

        eventually(|| peer.num_streams() == 1).await;
        // leave a busy timer armed to prove shutdown cancels it
        client.send(vec![Bytes::from_static(b"m1")]).await.unwrap();

        client.shut_down().await;

        eventually(|| peer.received_on(0).contains(&Packet::ShutDown)).await;
        eventually(|| events.log.lock().unwrap().contains(&"shut_down")).await;

        let state = client.session.shared.state.lock().unwrap();
        assert!(state.is_shut_down);
        for conn in state.connections.values() {
            assert!(conn.busy_timer.is_none());
            assert!(conn.reader_task.is_none());
            assert!(conn.writer.is_none());
        }
        drop(state);

        assert!(client.send(vec![Bytes::from_static(b"too late")]).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_reconnects_with_the_renew_flag() {
        let peer = TestPeer::new(true);
        let client = start_client(&peer, Arc::new(RecordingEvents::default()));
        eventually(|| peer.num_streams() == 1).await;

        client.renew().await;

        eventually(|| peer.num_streams() == 2).await;
        let head = peer.stream(1).head;
        assert!(head.is_renew);
        assert_eq!(head.connection_id, ConnectionId::from_raw(1));
        assert_eq!(head.session_id, client.session_id());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let peer = TestPeer::new(true);
        let result = BcpClient::start(
            BcpConfig { max_connections_per_session: 0, ..test_config() },
            Arc::new(PeerConnector { peer }),
            Arc::new(RecordingEvents::default()),
        );
        assert!(result.is_err());
    }
}
