use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::client::Connector;
use crate::config::BcpConfig;
use crate::connection::{Connection, Liveness};
use crate::crypto::PayloadCrypto;
use crate::error::{BcpError, ProtocolError, SessionViolation};
use crate::packets::{ConnectionHead, ConnectionId, Packet, PacketId, SessionId};
use crate::send_queue::{RotationKey, SendRotation, SendingQueue};
use crate::stream_io::{FrameReader, PacketWriter, StreamWriteQueue};

/// Callbacks from a session into the application. All callbacks for one session are
///  invoked sequentially, in the order the corresponding state transitions committed.
///  Errors (panics) from callbacks are not caught by the session.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionEvents: Send + Sync + 'static {
    /// one application message arrived (a message is delivered exactly once)
    async fn on_message(&self, buffers: Vec<Bytes>);

    /// the session became able to reach the peer (first usable connection attached)
    async fn on_available(&self);

    /// the session lost its last usable connection; messages are buffered until a
    ///  connection attaches again
    async fn on_unavailable(&self);

    /// the session ended gracefully
    async fn on_shut_down(&self);

    /// the session ended abnormally; buffered and unacknowledged messages are lost
    async fn on_interrupted(&self);
}

pub(crate) enum Role {
    Client { connector: Arc<dyn Connector> },
    Server,
}

#[derive(Debug)]
enum Notification {
    Received(Vec<Bytes>),
    Available,
    Unavailable,
    ShutDown,
    Interrupted,
}

/// Deferred side effects of one state transition. Socket writes, timer management and
///  stream teardown never happen while the state lock is held: a transition returns
///  them as data, and they are executed only if the transition committed. A transition
///  that fails must do so before its first state mutation, so an error never leaks
///  half-applied state, network bytes or armed timers.
#[derive(Default)]
struct Effects {
    notifications: Vec<Notification>,
    io: Vec<IoAction>,
    /// executed last, in one synchronous sweep: aborting a task only takes effect at
    ///  its next await point, so even a task aborting itself completes the sweep
    aborts: Vec<JoinHandle<()>>,
}

impl Effects {
    fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    fn send(&mut self, connection_id: ConnectionId, writer: Arc<dyn PacketWriter>, packet: Packet) {
        self.io.push(IoAction::Send { connection_id, writer, packet });
    }

    fn abort(&mut self, handle: JoinHandle<()>) {
        self.aborts.push(handle);
    }
}

enum IoAction {
    Send {
        connection_id: ConnectionId,
        writer: Arc<dyn PacketWriter>,
        packet: Packet,
    },
    CloseWriter(Arc<dyn PacketWriter>),
    ArmBusyTimer(ConnectionId),
    ArmIdleTimer,
    ArmReconnectTimer,
    Connect {
        connection_id: ConnectionId,
        is_renew: bool,
    },
}

/// what the receive loop should do after a packet was processed
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ReadFlow {
    Continue,
    Stop,
}

pub(crate) struct SessionState {
    pub connections: FxHashMap<ConnectionId, Connection>,
    /// the highest connection id ever observed or minted for this session; 0 = none yet
    pub last_connection_id: u32,
    pub sending_queue: SendingQueue,
    next_pick_stamp: u64,
    /// sticky terminal flag, set by both graceful shutdown and interrupt
    pub is_shut_down: bool,
    pub was_interrupted: bool,
    /// client: a connection attempt is in flight
    is_connecting: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    idle_timer: Option<JoinHandle<()>>,
}

impl SessionState {
    fn new() -> SessionState {
        SessionState {
            connections: FxHashMap::default(),
            last_connection_id: 0,
            sending_queue: SendingQueue::new(),
            next_pick_stamp: 0,
            is_shut_down: false,
            was_interrupted: false,
            is_connecting: false,
            reconnect_timer: None,
            idle_timer: None,
        }
    }
}

/// The session engine: one serial state domain multiplexing logical messages over all
///  of the session's connections.
///
/// Locking discipline: the state mutex is only ever held for purely computational
///  sections - no socket I/O, no timer waits, no user callbacks. Transitions collect
///  `Effects` that run after the lock is released; application callbacks additionally
///  go through a single dispatcher task so their order matches commit order even when
///  several stream readers commit concurrently.
pub(crate) struct SessionShared {
    pub config: Arc<BcpConfig>,
    pub session_id: SessionId,
    role: Role,
    crypto: Arc<dyn PayloadCrypto>,
    events: OnceLock<Arc<dyn SessionEvents>>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    pub state: Mutex<SessionState>,
}

impl SessionShared {
    pub fn new(
        config: Arc<BcpConfig>,
        session_id: SessionId,
        role: Role,
        crypto: Arc<dyn PayloadCrypto>,
    ) -> Arc<SessionShared> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Arc::new(SessionShared {
            config,
            session_id,
            role,
            crypto,
            events: OnceLock::new(),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            state: Mutex::new(SessionState::new()),
        })
    }

    fn is_client(&self) -> bool {
        matches!(self.role, Role::Client { .. })
    }

    /// Install the application event sink and start dispatching callbacks. Must happen
    ///  before the first stream is attached; notifications committed earlier would sit
    ///  undelivered until then.
    pub fn install_events(self: &Arc<Self>, events: Arc<dyn SessionEvents>) {
        if self.events.set(events.clone()).is_err() {
            warn!("session event sink installed twice - keeping the first one");
            return;
        }
        let mut rx = self.notify_rx.lock()
            .expect("this is a bug: session notification queue lock poisoned")
            .take()
            .expect("receiver present until events are installed");

        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let is_terminal = matches!(notification, Notification::ShutDown | Notification::Interrupted);
                match notification {
                    Notification::Received(buffers) => events.on_message(buffers).await,
                    Notification::Available => events.on_available().await,
                    Notification::Unavailable => events.on_unavailable().await,
                    Notification::ShutDown => events.on_shut_down().await,
                    Notification::Interrupted => events.on_interrupted().await,
                }
                if is_terminal {
                    break;
                }
            }
        });
    }

    // ---- the transactional core ----------------------------------------------------

    fn transact<R>(
        &self,
        f: impl FnOnce(&mut SessionState, &mut Effects) -> Result<R, BcpError>,
    ) -> Result<(R, Effects), BcpError> {
        let mut state = self.state.lock()
            .expect("this is a bug: session state lock poisoned");
        let mut effects = Effects::default();

        let result = f(&mut state, &mut effects)?;

        // committing: notifications enter the dispatcher queue while the lock is still
        //  held, so their order is exactly commit order
        for notification in effects.notifications.drain(..) {
            let _ = self.notify_tx.send(notification);
        }
        Ok((result, effects))
    }

    fn transact_ok<R>(&self, f: impl FnOnce(&mut SessionState, &mut Effects) -> R) -> (R, Effects) {
        self.transact(|state, fx| Ok(f(state, fx)))
            .expect("infallible transition")
    }

    fn apply<'a>(
        self: &'a Arc<Self>,
        effects: Effects,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let mut io = VecDeque::from(effects.io);
        let mut aborts = effects.aborts;

        while let Some(action) = io.pop_front() {
            match action {
                IoAction::Send { connection_id, writer, packet } => {
                    if writer.send_packet(packet).await.is_err() {
                        debug!("write queue of connection {} is gone - cleaning up", connection_id);
                        let (_, fx) = self.transact_ok(|state, fx| {
                            self.cleanup_connection(state, fx, connection_id, CleanupOrigin::Elsewhere);
                        });
                        io.extend(fx.io);
                        aborts.extend(fx.aborts);
                    }
                }
                IoAction::CloseWriter(writer) => writer.close().await,
                IoAction::ArmBusyTimer(connection_id) => {
                    let session = self.clone();
                    let delay = self.config.busy_timeout;
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        session.on_busy_timeout(connection_id).await;
                    });
                    let (_, fx) = self.transact_ok(|state, fx| {
                        let terminal = state.is_shut_down;
                        match state.connections.get_mut(&connection_id) {
                            Some(conn) if !terminal && conn.liveness == Liveness::Busy => {
                                if let Some(old) = conn.busy_timer.replace(handle) {
                                    fx.abort(old);
                                }
                            }
                            _ => fx.abort(handle),
                        }
                    });
                    io.extend(fx.io);
                    aborts.extend(fx.aborts);
                }
                IoAction::ArmIdleTimer => {
                    let session = self.clone();
                    let delay = self.config.idle_timeout;
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        session.on_idle_timeout().await;
                    });
                    let (_, fx) = self.transact_ok(|state, fx| {
                        if state.is_shut_down || state.idle_timer.is_some() {
                            fx.abort(handle);
                        }
                        else {
                            state.idle_timer = Some(handle);
                        }
                    });
                    io.extend(fx.io);
                    aborts.extend(fx.aborts);
                }
                IoAction::ArmReconnectTimer => {
                    let session = self.clone();
                    let delay = self.config.busy_timeout;
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        session.on_reconnect_timeout().await;
                    });
                    let (_, fx) = self.transact_ok(|state, fx| {
                        if state.is_shut_down || state.reconnect_timer.is_some() {
                            fx.abort(handle);
                        }
                        else {
                            state.reconnect_timer = Some(handle);
                        }
                    });
                    io.extend(fx.io);
                    aborts.extend(fx.aborts);
                }
                IoAction::Connect { connection_id, is_renew } => {
                    let session = self.clone();
                    tokio::spawn(async move {
                        session.connect_and_install(connection_id, is_renew).await;
                    });
                }
            }
        }

        for handle in aborts {
            handle.abort();
        }
        })
    }

    async fn run<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut SessionState, &mut Effects) -> Result<R, BcpError>,
    ) -> Result<R, BcpError> {
        let (result, effects) = self.transact(f)?;
        self.apply(effects).await;
        Ok(result)
    }

    // ---- outbound scheduling -------------------------------------------------------

    /// Schedule an `AcknowledgeRequired` packet: pick the head of the rotation, write
    ///  the packet there and record it as unconfirmed; with no connection attached,
    ///  buffer it (bounded). Never fails - an offline-buffer overflow interrupts the
    ///  session in place.
    fn enqueue(&self, state: &mut SessionState, fx: &mut Effects, packet: Packet) {
        if state.is_shut_down {
            return;
        }

        let picked = match &mut state.sending_queue {
            SendingQueue::Online(rotation) => {
                let connection_id = rotation.head()
                    .expect("this is a bug: an online sending queue is never empty");
                let was_all_confirmed = rotation.key_of(connection_id) == Some(RotationKey::AllConfirmed);
                let stamp = state.next_pick_stamp;
                state.next_pick_stamp += 1;
                rotation.insert(connection_id, RotationKey::LastPicked(stamp));
                Some((connection_id, was_all_confirmed))
            }
            SendingQueue::Offline(_) => None,
        };

        match picked {
            Some((connection_id, was_all_confirmed)) => {
                let conn = state.connections.get_mut(&connection_id)
                    .expect("this is a bug: the rotation only holds tracked connections");
                if matches!(packet, Packet::Data { .. }) {
                    conn.num_data_sent += 1;
                }
                conn.unconfirmed_packets.push_back(packet.clone());
                let writer = conn.writer.clone()
                    .expect("this is a bug: the rotation only holds connections with a live stream");
                fx.send(connection_id, writer, packet);

                if was_all_confirmed {
                    self.on_first_unconfirmed(state, fx, connection_id);
                }
            }
            None => {
                if let Err(violation) = state.sending_queue.push_offline(packet, self.config.max_offline_packets) {
                    warn!("{} - interrupting the session", violation);
                    self.do_interrupt(state, fx);
                }
            }
        }
    }

    /// write a fire-and-forget packet on the current head connection, without recording
    ///  it or rotating (an all-confirmed connection stays all-confirmed)
    fn try_send(&self, state: &mut SessionState, fx: &mut Effects, packet: Packet) {
        if let SendingQueue::Online(rotation) = &state.sending_queue {
            if let Some(connection_id) = rotation.head() {
                if let Some(writer) = state.connections.get(&connection_id).and_then(|c| c.writer.clone()) {
                    fx.send(connection_id, writer, packet);
                }
            }
        }
    }

    /// Idle -> Busy transition hook: an enqueue just made an all-confirmed connection's
    ///  unconfirmed queue non-empty
    fn on_first_unconfirmed(&self, state: &mut SessionState, fx: &mut Effects, connection_id: ConnectionId) {
        if !self.is_client() {
            return;
        }
        if let Some(conn) = state.connections.get_mut(&connection_id) {
            if conn.liveness == Liveness::Idle {
                conn.liveness = Liveness::Busy;
                fx.io.push(IoAction::ArmBusyTimer(connection_id));
            }
        }
    }

    /// Busy -> Idle transition hook: the last unconfirmed packet was acknowledged
    fn on_all_confirmed(&self, state: &mut SessionState, fx: &mut Effects, connection_id: ConnectionId) {
        if !self.is_client() {
            return;
        }
        if let Some(conn) = state.connections.get_mut(&connection_id) {
            if let Some(timer) = conn.busy_timer.take() {
                fx.abort(timer);
            }
            conn.liveness = Liveness::Idle;
        }
        self.maybe_arm_idle_trim(state, fx);
    }

    // ---- inbound processing --------------------------------------------------------

    /// Process one packet received on `connection_id`'s stream. Returns what the read
    ///  loop should do next; errors classify per the taxonomy (protocol errors end the
    ///  stream, session violations end the session - the read loop escalates).
    pub async fn handle_packet(
        self: &Arc<Self>,
        connection_id: ConnectionId,
        packet: Packet,
    ) -> Result<ReadFlow, BcpError> {
        // phase 1: acknowledge + route under the lock; payload decryption is CPU work
        //  and happens between the phases, outside the lock
        let (outcome, effects) = self.transact(|state, fx| {
            if state.is_shut_down {
                return Ok(PacketOutcome::Stop);
            }

            if packet.is_acknowledge_required() {
                // the ack goes out on the receiving stream, before any processing
                let writer = state.connections.get(&connection_id).and_then(|c| c.writer.clone());
                match writer {
                    Some(writer) => fx.send(connection_id, writer, Packet::Acknowledge),
                    None => return Ok(PacketOutcome::Stop),
                }
            }

            match packet {
                Packet::HeartBeat => {
                    // nothing to do: any received frame resets the read timeout
                    Ok(self.read_flow(state, connection_id))
                }
                Packet::Acknowledge => {
                    self.on_acknowledge(state, fx, connection_id);
                    Ok(self.read_flow(state, connection_id))
                }
                Packet::Data { buffers } => {
                    let Some(conn) = state.connections.get_mut(&connection_id) else {
                        return Ok(PacketOutcome::Stop);
                    };
                    let packet_id = conn.next_receive_packet_id();
                    Ok(PacketOutcome::Deliver { target: connection_id, packet_id, buffers })
                }
                Packet::RetransmissionData { connection_id: target, packet_id, buffers } => {
                    if self.ensure_connection(state, target)? {
                        Ok(PacketOutcome::Deliver { target, packet_id, buffers })
                    }
                    else {
                        // addressed to a connection that was already fully drained
                        trace!("retransmission for drained connection {} - ignoring", target);
                        Ok(self.read_flow(state, connection_id))
                    }
                }
                Packet::Finish => {
                    let Some(conn) = state.connections.get_mut(&connection_id) else {
                        return Ok(PacketOutcome::Stop);
                    };
                    if conn.finish_id_received.is_some() {
                        return Err(ProtocolError::AlreadyReceivedFinish {
                            connection_id: connection_id.to_raw(),
                        }.into());
                    }
                    let finish_id = conn.current_receive_packet_id();
                    self.on_remote_finish(state, fx, connection_id, finish_id);
                    Ok(self.read_flow(state, connection_id))
                }
                Packet::RetransmissionFinish { connection_id: target, packet_id } => {
                    if self.ensure_connection(state, target)? {
                        let conn = state.connections.get_mut(&target)
                            .expect("ensured above");
                        if conn.finish_id_received.is_some() {
                            return Err(ProtocolError::AlreadyReceivedFinish {
                                connection_id: target.to_raw(),
                            }.into());
                        }
                        self.on_remote_finish(state, fx, target, packet_id);
                    }
                    else {
                        trace!("retransmitted finish for drained connection {} - ignoring", target);
                    }
                    Ok(self.read_flow(state, connection_id))
                }
                Packet::ShutDown => {
                    debug!("peer shut the session down");
                    self.do_shut_down(state, fx, false);
                    Ok(PacketOutcome::Stop)
                }
            }
        })?;
        self.apply(effects).await;

        let (target, packet_id, buffers) = match outcome {
            PacketOutcome::Stop => return Ok(ReadFlow::Stop),
            PacketOutcome::Flow(flow) => return Ok(flow),
            PacketOutcome::Deliver { target, packet_id, buffers } => (target, packet_id, buffers),
        };

        // phase 2: de-duplicate cheaply, decrypt outside the lock, then commit delivery
        //  (re-checking, since another stream may have delivered the same id meanwhile)
        let already_delivered = {
            let state = self.state.lock().expect("this is a bug: session state lock poisoned");
            state.connections.get(&target)
                .map(|c| c.receive_id_set.contains(packet_id))
                .unwrap_or(true)
        };
        if already_delivered {
            trace!("duplicate packet {} for connection {} - dropping", packet_id, target);
            return self.run(|state, _| Ok(match self.read_flow(state, connection_id) {
                PacketOutcome::Stop => ReadFlow::Stop,
                _ => ReadFlow::Continue,
            })).await;
        }

        let mut decrypted = Vec::with_capacity(buffers.len());
        for sealed in buffers {
            decrypted.push(self.crypto.decrypt(sealed)?);
        }

        self.run(|state, fx| {
            if state.is_shut_down {
                return Ok(ReadFlow::Stop);
            }
            let Some(conn) = state.connections.get_mut(&target) else {
                return Ok(ReadFlow::Stop);
            };
            if conn.receive_id_set.contains(packet_id) {
                trace!("duplicate packet {} for connection {} - dropping", packet_id, target);
            }
            else {
                conn.receive_id_set.add(packet_id);
                fx.notify(Notification::Received(decrypted));
                self.maybe_remove(state, fx, target);
            }
            Ok(match self.read_flow(state, connection_id) {
                PacketOutcome::Stop => ReadFlow::Stop,
                _ => ReadFlow::Continue,
            })
        }).await
    }

    fn read_flow(&self, state: &SessionState, connection_id: ConnectionId) -> PacketOutcome {
        let still_open = state.connections.get(&connection_id)
            .map(|c| c.is_open())
            .unwrap_or(false);
        if state.is_shut_down || !still_open {
            PacketOutcome::Stop
        }
        else {
            PacketOutcome::Flow(ReadFlow::Continue)
        }
    }

    fn on_acknowledge(&self, state: &mut SessionState, fx: &mut Effects, connection_id: ConnectionId) {
        let Some(conn) = state.connections.get_mut(&connection_id) else {
            return;
        };
        match conn.acknowledge_head() {
            None => {
                debug!("acknowledge without an outstanding packet on connection {} - ignoring", connection_id);
            }
            Some(confirmed) => {
                trace!("connection {}: peer acknowledged {:?}", connection_id, confirmed);
                if conn.unconfirmed_packets.is_empty() {
                    if let SendingQueue::Online(rotation) = &mut state.sending_queue {
                        if rotation.contains(connection_id) {
                            rotation.insert(connection_id, RotationKey::AllConfirmed);
                        }
                    }
                    self.on_all_confirmed(state, fx, connection_id);
                    self.maybe_remove(state, fx, connection_id);
                }
            }
        }
    }

    /// Route lookup for retransmission targets. Unknown ids above the highest observed
    ///  one mean the original stream was lost before its handshake produced a record:
    ///  placeholder records are synthesized for the whole gap. Unknown ids at or below
    ///  it were already fully drained; `false` tells the caller to ignore the packet.
    fn ensure_connection(&self, state: &mut SessionState, target: ConnectionId) -> Result<bool, BcpError> {
        if state.connections.contains_key(&target) {
            return Ok(true);
        }
        let raw = target.to_raw();
        if raw == 0 || raw <= state.last_connection_id {
            return Ok(false);
        }

        let num_new = (raw - state.last_connection_id) as usize;
        if num_new + state.connections.len() >= self.config.max_connections_per_session {
            return Err(SessionViolation::TooManyConnections {
                max: self.config.max_connections_per_session,
            }.into());
        }

        debug!("retransmission for connection {} arrived before its handshake - synthesizing records {}..={}",
            target, state.last_connection_id + 1, raw);
        for id in (state.last_connection_id + 1)..=raw {
            state.connections.insert(ConnectionId::from_raw(id), Connection::new(ConnectionId::from_raw(id)));
        }
        state.last_connection_id = raw;
        Ok(true)
    }

    /// The peer declared it will send nothing further for `target` (either a `Finish`
    ///  on the connection's own live stream, or a retransmitted one via another
    ///  stream). Answer with the local half-close and check whether the record can go.
    fn on_remote_finish(&self, state: &mut SessionState, fx: &mut Effects, target: ConnectionId, finish_id: PacketId) {
        let Some(conn) = state.connections.get_mut(&target) else {
            return;
        };
        conn.finish_id_received = Some(finish_id);

        if conn.writer.is_some() {
            // the stream is alive: write our own finish on it and stop scheduling new
            //  packets onto it; acknowledges keep flowing until both sides drained
            self.finish_connection(state, fx, target);
        }
        else {
            // no stream (placeholder or already-detached record): record our half-close
            //  and redeliver it as a retransmission via the surviving connections
            self.cleanup_connection(state, fx, target, CleanupOrigin::Elsewhere);
        }
        self.maybe_remove(state, fx, target);
    }

    /// gracefully finish one connection: write `Finish`, record it as unconfirmed, and
    ///  take the connection out of the sending rotation
    fn finish_connection(&self, state: &mut SessionState, fx: &mut Effects, connection_id: ConnectionId) {
        let Some(conn) = state.connections.get_mut(&connection_id) else {
            return;
        };
        if conn.is_finish_sent || !conn.is_open() {
            return;
        }
        conn.is_finish_sent = true;
        conn.unconfirmed_packets.push_back(Packet::Finish);
        let writer = conn.writer.clone().expect("open connection has a writer");
        fx.send(connection_id, writer, Packet::Finish);

        if let SendingQueue::Online(rotation) = &mut state.sending_queue {
            rotation.remove(connection_id);
        }
        self.transition_offline_if_empty(state, fx);
    }

    // ---- connection cleanup and removal --------------------------------------------

    /// Stream lost (I/O error, timeout, codec violation) or finished remotely while
    ///  detached: detach the stream, make sure a local `Finish` is recorded, and
    ///  redistribute everything unacknowledged as retransmissions across the surviving
    ///  connections (or the offline buffer).
    fn cleanup_connection(
        &self,
        state: &mut SessionState,
        fx: &mut Effects,
        connection_id: ConnectionId,
        origin: CleanupOrigin,
    ) {
        if state.is_shut_down || !state.connections.contains_key(&connection_id) {
            return;
        }

        if let SendingQueue::Online(rotation) = &mut state.sending_queue {
            rotation.remove(connection_id);
        }

        let retransmissions = {
            let conn = state.connections.get_mut(&connection_id)
                .expect("checked above");
            if !conn.is_finish_sent {
                conn.unconfirmed_packets.push_back(Packet::Finish);
                conn.is_finish_sent = true;
            }
            if let Some(timer) = conn.busy_timer.take() {
                fx.abort(timer);
            }
            match conn.reader_task.take() {
                Some(reader) if origin == CleanupOrigin::Elsewhere => fx.abort(reader),
                _ => {} // the reader is the caller and exits on its own
            }
            if let Some(writer) = conn.writer.take() {
                fx.io.push(IoAction::CloseWriter(writer));
            }
            conn.liveness = Liveness::Idle;

            let retransmissions = conn.unconfirmed_as_retransmissions();
            conn.unconfirmed_packets.clear();
            retransmissions
        };

        // go offline first if this was the last open connection, so the
        //  retransmissions below are buffered rather than lost
        self.transition_offline_if_empty(state, fx);

        if !retransmissions.is_empty() {
            debug!("connection {} lost with {} unacknowledged packets - redistributing",
                connection_id, retransmissions.len());
        }
        for packet in retransmissions {
            self.enqueue(state, fx, packet);
        }

        self.maybe_remove(state, fx, connection_id);
        self.maybe_reconnect(state, fx);
    }

    /// drop the record once both directions are finished and fully drained
    fn maybe_remove(&self, state: &mut SessionState, fx: &mut Effects, connection_id: ConnectionId) {
        if state.is_shut_down {
            return;
        }
        let removable = state.connections.get(&connection_id)
            .map(|c| c.can_be_removed())
            .unwrap_or(false);
        if !removable {
            return;
        }

        debug!("connection {} is fully drained - removing", connection_id);
        let mut conn = state.connections.remove(&connection_id)
            .expect("checked above");
        if let Some(timer) = conn.busy_timer.take() {
            fx.abort(timer);
        }
        if let Some(reader) = conn.reader_task.take() {
            fx.abort(reader);
        }
        if let Some(writer) = conn.writer.take() {
            fx.io.push(IoAction::CloseWriter(writer));
        }
        if let SendingQueue::Online(rotation) = &mut state.sending_queue {
            rotation.remove(connection_id);
        }
        self.transition_offline_if_empty(state, fx);
        self.maybe_reconnect(state, fx);
    }

    fn transition_offline_if_empty(&self, state: &mut SessionState, fx: &mut Effects) {
        if let SendingQueue::Online(rotation) = &state.sending_queue {
            if rotation.is_empty() {
                debug!("no usable connection left - buffering outgoing packets");
                state.sending_queue = SendingQueue::new();
                fx.notify(Notification::Unavailable);
            }
        }
    }

    // ---- stream attachment ---------------------------------------------------------

    /// Install a new stream's write queue under `connection_id`, enforcing the
    ///  attachment safeguards. `Ok(true)` = installed (the caller starts the read
    ///  loop), `Ok(false)` = this stream is rejected but the session lives on, `Err` =
    ///  session-level violation (the caller interrupts the session).
    pub async fn add_stream(
        self: &Arc<Self>,
        connection_id: ConnectionId,
        writer: Arc<dyn PacketWriter>,
    ) -> Result<bool, BcpError> {
        self.run(|state, fx| {
            state.is_connecting = false;
            if state.is_shut_down {
                return Ok(false);
            }

            let raw = connection_id.to_raw();
            if raw == 0 || raw < state.last_connection_id {
                return Err(SessionViolation::ConnectionIdRegression {
                    connection_id: raw,
                    last_connection_id: state.last_connection_id,
                }.into());
            }

            let num_live = state.connections.values().filter(|c| c.is_open()).count();
            if num_live >= self.config.max_active_connections_per_session {
                debug!("already {} live streams - rejecting stream for connection {}", num_live, connection_id);
                return Ok(false);
            }

            if raw == state.last_connection_id {
                match state.connections.get(&connection_id) {
                    Some(conn) if conn.is_open() => {
                        debug!("connection {} already has a live stream - rejecting the duplicate", connection_id);
                        return Ok(false);
                    }
                    Some(conn) if conn.is_finish_sent || conn.is_shut_down => {
                        debug!("connection {} is already finishing - rejecting its late stream", connection_id);
                        return Ok(false);
                    }
                    Some(_) => {
                        // detached record: the stream attaches to it below
                    }
                    None => {
                        debug!("connection {} was already drained - rejecting its late stream", connection_id);
                        return Ok(false);
                    }
                }
            }
            else {
                // raw > last: records for the gap (streams lost before handshake) plus
                //  the new connection itself
                if state.connections.len() >= self.config.max_connections_per_session {
                    debug!("session already tracks {} connections - rejecting stream for connection {}",
                        state.connections.len(), connection_id);
                    return Ok(false);
                }
                let num_new = (raw - state.last_connection_id) as usize;
                if num_new + state.connections.len() >= self.config.max_connections_per_session {
                    return Err(SessionViolation::TooManyConnections {
                        max: self.config.max_connections_per_session,
                    }.into());
                }
                for id in (state.last_connection_id + 1)..=raw {
                    state.connections.insert(ConnectionId::from_raw(id), Connection::new(ConnectionId::from_raw(id)));
                }
                state.last_connection_id = raw;
            }

            debug!("attaching stream as connection {}", connection_id);
            {
                let conn = state.connections.get_mut(&connection_id)
                    .expect("record ensured above");
                conn.writer = Some(writer);
                conn.liveness = Liveness::Idle;
            }

            match std::mem::replace(&mut state.sending_queue, SendingQueue::new()) {
                SendingQueue::Offline(buffered) => {
                    let mut rotation = SendRotation::new();
                    rotation.insert(connection_id, RotationKey::AllConfirmed);
                    state.sending_queue = SendingQueue::Online(rotation);
                    fx.notify(Notification::Available);

                    if !buffered.is_empty() {
                        debug!("flushing {} buffered packets onto connection {}", buffered.len(), connection_id);
                    }
                    for packet in buffered {
                        self.enqueue(state, fx, packet);
                    }
                }
                online @ SendingQueue::Online(_) => {
                    state.sending_queue = online;
                    if let SendingQueue::Online(rotation) = &mut state.sending_queue {
                        rotation.insert(connection_id, RotationKey::AllConfirmed);
                    }
                }
            }
            self.maybe_arm_idle_trim(state, fx);
            Ok(true)
        }).await
    }

    /// attach a freshly connected/accepted stream and start its read loop
    pub async fn install_stream<R: AsyncRead + Send + Unpin + 'static>(
        self: &Arc<Self>,
        connection_id: ConnectionId,
        frame_reader: FrameReader<R>,
        writer: Arc<dyn PacketWriter>,
    ) {
        match self.add_stream(connection_id, writer.clone()).await {
            Ok(true) => self.spawn_reader(connection_id, frame_reader).await,
            Ok(false) => writer.close().await,
            Err(e) => {
                warn!("stream for connection {} violates session state ({}) - interrupting", connection_id, e);
                writer.close().await;
                self.interrupt_now().await;
            }
        }
    }

    async fn spawn_reader<R: AsyncRead + Send + Unpin + 'static>(
        self: &Arc<Self>,
        connection_id: ConnectionId,
        frame_reader: FrameReader<R>,
    ) {
        let handle = tokio::spawn(Self::reader_loop(self.clone(), connection_id, frame_reader));

        let (_, fx) = self.transact_ok(|state, fx| {
            let terminal = state.is_shut_down;
            match state.connections.get_mut(&connection_id) {
                Some(conn) if !terminal && conn.is_open() => {
                    if let Some(old) = conn.reader_task.replace(handle) {
                        fx.abort(old);
                    }
                }
                _ => fx.abort(handle),
            }
        });
        self.apply(fx).await;
    }

    async fn reader_loop<R: AsyncRead + Send + Unpin>(
        session: Arc<SessionShared>,
        connection_id: ConnectionId,
        mut frame_reader: FrameReader<R>,
    ) {
        loop {
            match frame_reader.next_packet().await {
                Ok(packet) => {
                    trace!("connection {}: received {:?}", connection_id, packet);
                    match session.handle_packet(connection_id, packet).await {
                        Ok(ReadFlow::Continue) => {}
                        Ok(ReadFlow::Stop) => break,
                        Err(BcpError::Session(violation)) => {
                            warn!("connection {}: {} - interrupting the session", connection_id, violation);
                            session.interrupt_now().await;
                            break;
                        }
                        Err(e) => {
                            debug!("connection {}: {} - tearing the stream down", connection_id, e);
                            session.on_stream_lost(connection_id).await;
                            break;
                        }
                    }
                }
                Err(BcpError::Transport(e)) => {
                    debug!("connection {}: {} - cleaning up", connection_id, e);
                    session.on_stream_lost(connection_id).await;
                    break;
                }
                Err(e) => {
                    debug!("connection {}: malformed frame ({}) - tearing the stream down", connection_id, e);
                    session.on_stream_lost(connection_id).await;
                    break;
                }
            }
        }
    }

    /// entry point for the read loop when its own stream died
    pub async fn on_stream_lost(self: &Arc<Self>, connection_id: ConnectionId) {
        let (_, fx) = self.transact_ok(|state, fx| {
            self.cleanup_connection(state, fx, connection_id, CleanupOrigin::OwnReader);
        });
        self.apply(fx).await;
    }

    // ---- client-side connection-count adaptation -----------------------------------

    /// Open one more connection iff no attempt is in flight, the session has room, and
    ///  every open connection is slow (also covers "no connection at all").
    fn increase_connection(&self, state: &mut SessionState, fx: &mut Effects) {
        if !self.is_client() || state.is_shut_down || state.is_connecting {
            return;
        }
        if state.connections.len() > self.config.max_connections_per_session {
            return;
        }
        let all_slow = state.connections.values()
            .filter(|c| c.is_open())
            .all(|c| c.liveness == Liveness::Slow);
        if !all_slow {
            return;
        }

        match ConnectionId::from_raw(state.last_connection_id).next() {
            Some(next_id) => {
                debug!("opening connection {}", next_id);
                state.is_connecting = true;
                fx.io.push(IoAction::Connect { connection_id: next_id, is_renew: false });
            }
            None => {
                warn!("{} - interrupting the session", SessionViolation::ConnectionIdOverflow);
                self.do_interrupt(state, fx);
            }
        }
    }

    /// client: the session lost its last open connection but is still alive - try to
    ///  re-establish connectivity right away
    fn maybe_reconnect(&self, state: &mut SessionState, fx: &mut Effects) {
        if !self.is_client() || state.is_shut_down {
            return;
        }
        let any_open = state.connections.values().any(|c| c.is_open());
        if !any_open && state.reconnect_timer.is_none() {
            self.increase_connection(state, fx);
        }
    }

    async fn connect_and_install(self: Arc<Self>, connection_id: ConnectionId, is_renew: bool) {
        let Role::Client { connector } = &self.role else {
            return;
        };
        match connector.connect().await {
            Ok(stream) => {
                let (read_half, write_half) = tokio::io::split(stream);
                let head = ConnectionHead {
                    session_id: self.session_id,
                    is_renew,
                    connection_id,
                };
                let writer = Arc::new(StreamWriteQueue::spawn(
                    write_half,
                    Some(head),
                    self.config.heart_beat_delay,
                    self.config.writing_timeout,
                ));
                let frame_reader = FrameReader::new(read_half, self.config.max_data_size, self.config.reading_timeout);
                self.install_stream(connection_id, frame_reader, writer).await;
            }
            Err(e) => {
                warn!("connecting a new stream failed: {:#}", e);
                self.on_connect_failed().await;
            }
        }
    }

    async fn on_connect_failed(self: &Arc<Self>) {
        let (_, fx) = self.transact_ok(|state, fx| {
            state.is_connecting = false;
            if state.is_shut_down {
                return;
            }
            if state.reconnect_timer.is_none() {
                fx.io.push(IoAction::ArmReconnectTimer);
            }
        });
        self.apply(fx).await;
    }

    async fn on_reconnect_timeout(self: &Arc<Self>) {
        let (_, fx) = self.transact_ok(|state, fx| {
            state.reconnect_timer = None;
            if state.is_shut_down {
                return;
            }
            self.increase_connection(state, fx);
        });
        self.apply(fx).await;
    }

    async fn on_busy_timeout(self: &Arc<Self>, connection_id: ConnectionId) {
        let (_, fx) = self.transact_ok(|state, fx| {
            let terminal = state.is_shut_down;
            let Some(conn) = state.connections.get_mut(&connection_id) else {
                return;
            };
            conn.busy_timer = None;
            if terminal {
                return;
            }
            if conn.liveness == Liveness::Busy && !conn.unconfirmed_packets.is_empty() {
                debug!("connection {} stayed busy past the busy timeout - classifying as slow", connection_id);
                conn.liveness = Liveness::Slow;
                self.increase_connection(state, fx);
            }
        });
        self.apply(fx).await;
    }

    fn maybe_arm_idle_trim(&self, state: &mut SessionState, fx: &mut Effects) {
        if !self.is_client() || state.is_shut_down || state.idle_timer.is_some() {
            return;
        }
        let has_surplus_idle = state.connections.len() > 1
            && state.connections.values().any(|c| c.is_schedulable() && c.liveness == Liveness::Idle);
        if has_surplus_idle {
            fx.io.push(IoAction::ArmIdleTimer);
        }
    }

    async fn on_idle_timeout(self: &Arc<Self>) {
        let (_, fx) = self.transact_ok(|state, fx| {
            state.idle_timer = None;
            if state.is_shut_down {
                return;
            }
            if state.connections.len() > 1 {
                let idle_connection = state.connections.values()
                    .filter(|c| c.is_schedulable() && c.liveness == Liveness::Idle)
                    .map(|c| c.id)
                    .min_by_key(|id| id.to_raw());
                if let Some(connection_id) = idle_connection {
                    debug!("connection {} stayed idle past the idle timeout - gracefully finishing it", connection_id);
                    self.finish_connection(state, fx, connection_id);
                }
            }
            self.maybe_arm_idle_trim(state, fx);
        });
        self.apply(fx).await;
    }

    // ---- shutdown ------------------------------------------------------------------

    /// graceful session end; `announce` controls whether a `ShutDown` frame is sent
    ///  (it is not when we are reacting to the peer's)
    fn do_shut_down(&self, state: &mut SessionState, fx: &mut Effects, announce: bool) {
        if state.is_shut_down {
            return;
        }
        if announce {
            self.try_send(state, fx, Packet::ShutDown);
        }
        state.is_shut_down = true;
        self.teardown(state, fx);
        state.sending_queue = SendingQueue::new();
        fx.notify(Notification::ShutDown);
    }

    /// abnormal session end: like shutdown, but nothing is announced, pending data is
    ///  abandoned, and the connection map is cleared entirely
    fn do_interrupt(&self, state: &mut SessionState, fx: &mut Effects) {
        if state.is_shut_down {
            return;
        }
        state.is_shut_down = true;
        state.was_interrupted = true;
        self.teardown(state, fx);
        state.connections.clear();
        state.sending_queue = SendingQueue::new();
        fx.notify(Notification::Interrupted);
    }

    /// detach and close every stream, cancel every timer
    fn teardown(&self, state: &mut SessionState, fx: &mut Effects) {
        for conn in state.connections.values_mut() {
            conn.is_shut_down = true;
            if let Some(timer) = conn.busy_timer.take() {
                fx.abort(timer);
            }
            if let Some(reader) = conn.reader_task.take() {
                fx.abort(reader);
            }
            if let Some(writer) = conn.writer.take() {
                fx.io.push(IoAction::CloseWriter(writer));
            }
        }
        if let Some(timer) = state.reconnect_timer.take() {
            fx.abort(timer);
        }
        if let Some(timer) = state.idle_timer.take() {
            fx.abort(timer);
        }
        state.is_connecting = false;
    }

    pub async fn shut_down_now(self: &Arc<Self>) {
        let (_, fx) = self.transact_ok(|state, fx| self.do_shut_down(state, fx, true));
        self.apply(fx).await;
    }

    pub async fn interrupt_now(self: &Arc<Self>) {
        let (_, fx) = self.transact_ok(|state, fx| self.do_interrupt(state, fx));
        self.apply(fx).await;
    }

    // ---- server-side renewal -------------------------------------------------------

    /// full restart requested via a handshake with the renew flag: discard all
    ///  connections, counters and buffered packets, keep the session itself
    pub async fn renew(self: &Arc<Self>) {
        let (_, fx) = self.transact_ok(|state, fx| {
            if state.is_shut_down {
                return;
            }
            debug!("renewing the session - discarding all connections and counters");
            for conn in state.connections.values_mut() {
                if let Some(timer) = conn.busy_timer.take() {
                    fx.abort(timer);
                }
                if let Some(reader) = conn.reader_task.take() {
                    fx.abort(reader);
                }
                if let Some(writer) = conn.writer.take() {
                    fx.io.push(IoAction::CloseWriter(writer));
                }
            }
            state.connections.clear();
            state.last_connection_id = 0;
            state.sending_queue = SendingQueue::new();
            state.is_connecting = false;
            if let Some(timer) = state.reconnect_timer.take() {
                fx.abort(timer);
            }
            if let Some(timer) = state.idle_timer.take() {
                fx.abort(timer);
            }
        });
        self.apply(fx).await;
    }

    // ---- public operations ---------------------------------------------------------

    pub async fn send(self: &Arc<Self>, buffers: Vec<Bytes>) -> Result<(), BcpError> {
        // sealing is CPU work and stays outside the lock
        let sealed: Vec<Bytes> = buffers.into_iter()
            .map(|b| self.crypto.encrypt(b))
            .collect();
        let total_len: u64 = sealed.iter().map(|b| b.len() as u64).sum();
        if total_len > self.config.max_data_size as u64 {
            return Err(crate::error::CodecError::DataTooBig {
                declared: total_len,
                max: self.config.max_data_size,
            }.into());
        }

        self.run(|state, fx| {
            if state.is_shut_down {
                return Err(BcpError::SessionClosed);
            }
            self.enqueue(state, fx, Packet::Data { buffers: sealed });
            Ok(())
        }).await
    }

    /// start the client's initial connection
    pub async fn kick_off(self: &Arc<Self>) {
        let (_, fx) = self.transact_ok(|state, fx| self.increase_connection(state, fx));
        self.apply(fx).await;
    }

    /// client-initiated full restart: reset local state, then reconnect with the renew
    ///  flag so the server discards its side as well
    pub async fn kick_off_renew(self: &Arc<Self>) {
        let (_, fx) = self.transact_ok(|state, fx| {
            if state.is_shut_down || state.is_connecting {
                return;
            }
            for conn in state.connections.values_mut() {
                if let Some(timer) = conn.busy_timer.take() {
                    fx.abort(timer);
                }
                if let Some(reader) = conn.reader_task.take() {
                    fx.abort(reader);
                }
                if let Some(writer) = conn.writer.take() {
                    fx.io.push(IoAction::CloseWriter(writer));
                }
            }
            state.connections.clear();
            state.last_connection_id = 0;
            state.sending_queue = SendingQueue::new();
            state.is_connecting = true;
            fx.io.push(IoAction::Connect { connection_id: ConnectionId::from_raw(1), is_renew: true });
        });
        self.apply(fx).await;
    }
}

enum PacketOutcome {
    Deliver {
        target: ConnectionId,
        packet_id: PacketId,
        buffers: Vec<Bytes>,
    },
    Flow(ReadFlow),
    Stop,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CleanupOrigin {
    /// cleanup runs inside the connection's own read loop, which exits by itself
    OwnReader,
    Elsewhere,
}

/// Handle to one BCP session, shared by the client and server roles: the application
///  sends messages and ends the session through it.
#[derive(Clone)]
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.shared.session_id
    }

    /// Send one message (one or more buffers, delivered together and exactly once).
    ///  Fails if the session is shut down or the message exceeds `max_data_size`.
    pub async fn send(&self, buffers: Vec<Bytes>) -> anyhow::Result<()> {
        self.shared.send(buffers).await.map_err(Into::into)
    }

    /// graceful exit: announce the shutdown to the peer, close all streams
    pub async fn shut_down(&self) {
        self.shared.shut_down_now().await;
    }

    /// abrupt exit: close all streams, abandon pending data
    pub async fn interrupt(&self) {
        self.shared.interrupt_now().await;
    }
}
