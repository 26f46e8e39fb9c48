use std::time::Duration;
use anyhow::bail;

/// Tunables for a BCP endpoint. The same struct configures both roles; the client-only
///  values are ignored on the server side.
///
/// All limits are per session. BCP does not attempt to guess good values from the
///  environment - choosing them is the operator's responsibility, and both peers should
///  run with compatible settings (most importantly `max_data_size`, which the receiver
///  enforces on the wire).
#[derive(Debug, Clone)]
pub struct BcpConfig {
    /// Upper bound for the number of *tracked* connections, i.e. including records that
    ///  are kept only because they still have undelivered or unacknowledged packets.
    ///  Exceeding this bound interrupts the session - it defends against connection-id
    ///  bloat from a misbehaving peer.
    pub max_connections_per_session: usize,

    /// Upper bound for the number of connections with a live stream attached. Streams
    ///  beyond this bound are rejected individually, the session itself survives.
    pub max_active_connections_per_session: usize,

    /// Number of packets that may be buffered while no connection is attached. Overflow
    ///  interrupts the session: the caller is producing data faster than connectivity
    ///  recovers, and there is no bound on how stale the buffered messages would get.
    pub max_offline_packets: usize,

    /// Maximum total payload length of a single message (sum over its buffers). The
    ///  receiver enforces this during frame decoding and fails with `DataTooBig`.
    pub max_data_size: u32,

    /// A `HeartBeat` frame is written whenever a stream had nothing to send for this
    ///  long, so an idle but healthy stream keeps passing the peer's read timeout.
    pub heart_beat_delay: Duration,

    /// If no frame (heartbeats included) arrives on a stream for this long, the stream
    ///  is considered dead and cleaned up.
    pub reading_timeout: Duration,

    /// Upper bound for a single frame write on a stream, including the time spent
    ///  waiting for the peer to drain its receive window.
    pub writing_timeout: Duration,

    /// Client only: how long a connection may stay busy (unacknowledged packets
    ///  outstanding) before it is classified as slow, and also the delay before a
    ///  failed connection attempt is retried.
    pub busy_timeout: Duration,

    /// Client only: how long a surplus connection may stay idle before one idle
    ///  connection is gracefully finished.
    pub idle_timeout: Duration,
}

impl BcpConfig {
    pub fn default_for(num_expected_connections: usize) -> BcpConfig {
        BcpConfig {
            max_connections_per_session: num_expected_connections.max(8) * 2,
            max_active_connections_per_session: num_expected_connections.max(4),
            max_offline_packets: 256,
            max_data_size: 16 * 1024 * 1024,
            heart_beat_delay: Duration::from_secs(3),
            reading_timeout: Duration::from_secs(10),
            writing_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(20),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections_per_session == 0 {
            bail!("a session needs at least one connection");
        }
        if self.max_active_connections_per_session == 0 {
            bail!("a session needs at least one active connection");
        }
        if self.max_active_connections_per_session > self.max_connections_per_session {
            bail!("active connection limit exceeds the tracked connection limit");
        }
        if self.max_data_size == 0 {
            bail!("max_data_size must allow at least one byte of payload");
        }
        if self.reading_timeout <= self.heart_beat_delay {
            bail!("reading timeout must be longer than the heartbeat delay, or healthy idle streams get torn down");
        }
        Ok(())
    }
}
