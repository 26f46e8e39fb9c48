//! BCP (Bundled Connection Protocol) is a reliable, message-oriented session layer on
//!  top of multiple concurrent reliable byte streams (typically TCP). A *session*
//!  bundles one-to-many streams into a single logical bidirectional channel that
//!  survives the loss of individual streams: as long as at least one stream is alive
//!  (or can be re-established), the session's message stream stays intact, with
//!  at-most-once delivery of the caller's messages.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (each one or more buffers that
//!   travel and arrive together), not a stream of bytes
//! * Survive the loss of any individual stream: packets that were written but not
//!   acknowledged when a stream dies are re-sent over the surviving streams, with
//!   explicit addressing so the receiver can de-duplicate
//! * At-most-once delivery under arbitrary retransmission and duplication
//! * The client adapts the number of bundled streams to the observed behaviour of the
//!   existing ones: a stream that stays busy too long is classified as slow, and a new
//!   stream is opened only once *all* streams are slow; surplus idle streams are
//!   gracefully drained and closed again
//! * No handshake beyond one fixed-size frame per stream; a session is identified by
//!   an opaque 16-byte id minted by the client, and the server bundles streams by that
//!   id
//! * Heartbeats per stream, so idle but healthy streams are distinguishable from dead
//!   ones via read timeouts
//! * Optional payload sealing behind a small hook; the wire format itself is oblivious
//!   to it
//!
//! Explicitly *not* goals: congestion control beyond the connection-count heuristic,
//!  per-message priorities, authentication, and streaming of partial messages.
//!
//! ## Wire format
//!
//! The first frame on every stream is the handshake:
//!
//! ```ascii
//! 0:  session id (16 bytes, opaque)
//! 16: renew flag (u8, 0 or 1) - 1 discards all of the server's session state first
//! 17: connection id (varint u32) - session-unique id of this stream
//! ```
//!
//! Every following frame is `[1-byte tag][payload]`:
//!
//! ```ascii
//! 0 HeartBeat             (no payload)
//! 1 Data                  varint buffer count, then per buffer: varint length, bytes
//! 2 Acknowledge           (no payload)
//! 3 Finish                (no payload)
//! 4 RetransmissionData    varint connection id, varint packet id, buffers as in Data
//! 5 RetransmissionFinish  varint connection id, varint packet id
//! 6 ShutDown              (no payload)
//! ```
//!
//! `Data`, `Finish`, `RetransmissionData` and `RetransmissionFinish` must each be
//!  answered by exactly one `Acknowledge`, sent on the same stream in the order
//!  received and before any application-level processing. A packet that was written
//!  but not yet acknowledged when its stream dies is rewritten as its retransmission
//!  flavor - carrying the original connection id and the packet's position in that
//!  connection's data sequence - and re-sent over the remaining streams. The receiver
//!  tracks delivered `(connection id, packet id)` pairs in a rolling window, so a
//!  message is handed to the application exactly once no matter how often and on which
//!  stream it arrives.
//!
//! Packet ids wrap around the full 32-bit space; all id arithmetic is modular.
//!
//! ## Concurrency model
//!
//! Each session is one serial state domain behind a mutex that is only held for pure
//!  computation. Socket writes, timer scheduling and teardown are collected as
//!  deferred effects and executed after the lock is released; application callbacks
//!  additionally flow through a per-session dispatcher task, so the application
//!  observes state transitions in commit order. Every stream has its own reader task
//!  (frame decoding, read timeout) and writer task (write queue, write timeout,
//!  heartbeat emission).

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod id_set;
pub mod packets;
pub mod safe_converter;
pub mod server;
pub mod session;
pub mod stream_io;

mod connection;
mod send_queue;
