use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tracing::{debug, info, trace};

use crate::config::BcpConfig;
use crate::crypto::{NoCrypto, PayloadCrypto};
use crate::packets::SessionId;
use crate::session::{Role, Session, SessionEvents, SessionShared};
use crate::stream_io::{BoxedByteStream, FrameReader, StreamWriteQueue};

/// Server-side application hook: called once per freshly created session (i.e. on the
///  first stream that presents an unknown session id). Returns the event sink for that
///  session; the handle can be kept for sending.
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    async fn on_accepted(&self, session: Session) -> Arc<dyn SessionEvents>;
}

/// Server side of BCP: accepts streams, reads their handshake, and dispatches each
///  stream into the right session - creating the session on first contact and
///  resetting it when the handshake carries the renew flag.
#[derive(Clone)]
pub struct BcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: Arc<BcpConfig>,
    handler: Arc<dyn ServerHandler>,
    crypto: Arc<dyn PayloadCrypto>,
    /// keyed by session id *content*; entries are evicted when their session ends
    sessions: Mutex<FxHashMap<SessionId, Arc<SessionShared>>>,
}

impl BcpServer {
    pub fn new(config: BcpConfig, handler: Arc<dyn ServerHandler>) -> anyhow::Result<BcpServer> {
        Self::with_crypto(config, handler, Arc::new(NoCrypto))
    }

    pub fn with_crypto(
        config: BcpConfig,
        handler: Arc<dyn ServerHandler>,
        crypto: Arc<dyn PayloadCrypto>,
    ) -> anyhow::Result<BcpServer> {
        config.validate()?;
        Ok(BcpServer {
            inner: Arc::new(ServerInner {
                config: Arc::new(config),
                handler,
                crypto,
                sessions: Mutex::new(FxHashMap::default()),
            }),
        })
    }

    /// accept loop over a TCP listener; runs until the listener fails
    pub async fn listen(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!("listening on {:?}", listener.local_addr()?);
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            trace!("accepted stream from {:?}", peer_addr);
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.attach(Box::new(stream)).await {
                    debug!("handshake with {:?} failed: {:#}", peer_addr, e);
                }
            });
        }
    }

    /// Dispatch one already-accepted stream (reads its handshake first). Useful for
    ///  transports other than plain TCP.
    pub async fn attach_stream(&self, stream: BoxedByteStream) -> anyhow::Result<()> {
        self.inner.attach(stream).await
    }

    pub fn num_sessions(&self) -> usize {
        self.inner.sessions.lock()
            .expect("this is a bug: session table lock poisoned")
            .len()
    }
}

impl ServerInner {
    async fn attach(self: &Arc<Self>, stream: BoxedByteStream) -> anyhow::Result<()> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frame_reader = FrameReader::new(
            read_half,
            self.config.max_data_size,
            self.config.reading_timeout,
        );
        let head = frame_reader.read_connection_head().await
            .map_err(anyhow::Error::from)?;
        trace!("stream handshake: session {:?}, connection {}, renew: {}",
            head.session_id, head.connection_id, head.is_renew);

        let (session, is_new) = {
            let mut sessions = self.sessions.lock()
                .expect("this is a bug: session table lock poisoned");
            match sessions.get(&head.session_id) {
                Some(session) => (session.clone(), false),
                None => {
                    let session = SessionShared::new(
                        self.config.clone(),
                        head.session_id,
                        Role::Server,
                        self.crypto.clone(),
                    );
                    sessions.insert(head.session_id, session.clone());
                    (session, true)
                }
            }
        };

        if is_new {
            debug!("first contact for session {:?} - creating it", head.session_id);
            let events = self.handler.on_accepted(Session { shared: session.clone() }).await;
            session.install_events(Arc::new(EvictingEvents {
                inner: events,
                server: Arc::downgrade(self),
                session_id: head.session_id,
            }));
        }
        else if head.is_renew {
            debug!("session {:?}: renew requested", head.session_id);
            session.renew().await;
        }

        let writer = Arc::new(StreamWriteQueue::spawn(
            write_half,
            None,
            self.config.heart_beat_delay,
            self.config.writing_timeout,
        ));
        session.install_stream(head.connection_id, frame_reader, writer).await;
        Ok(())
    }

    fn evict(&self, session_id: SessionId) {
        let removed = self.sessions.lock()
            .expect("this is a bug: session table lock poisoned")
            .remove(&session_id);
        if removed.is_some() {
            debug!("session {:?} ended - removing it from the session table", session_id);
        }
    }
}

/// wraps the application's event sink so that a session that ends takes itself out of
///  the server's session table
struct EvictingEvents {
    inner: Arc<dyn SessionEvents>,
    server: Weak<ServerInner>,
    session_id: SessionId,
}

#[async_trait]
impl SessionEvents for EvictingEvents {
    async fn on_message(&self, buffers: Vec<Bytes>) {
        self.inner.on_message(buffers).await;
    }

    async fn on_available(&self) {
        self.inner.on_available().await;
    }

    async fn on_unavailable(&self) {
        self.inner.on_unavailable().await;
    }

    async fn on_shut_down(&self) {
        if let Some(server) = self.server.upgrade() {
            server.evict(self.session_id);
        }
        self.inner.on_shut_down().await;
    }

    async fn on_interrupted(&self) {
        if let Some(server) = self.server.upgrade() {
            server.evict(self.session_id);
        }
        self.inner.on_interrupted().await;
    }
}
