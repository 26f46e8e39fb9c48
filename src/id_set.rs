use std::collections::BTreeSet;

use crate::packets::PacketId;

/// Compact set of "which packet ids were received" within a rolling window.
///
/// The window starts at `low` (the lowest id that was *not* received yet) and ids are
///  tracked as offsets from it. Receiving consecutive ids advances the window, so under
///  loss-free operation the set stays empty and only the marker moves. Ids below the
///  window are presumed delivered long ago: the peer only retransmits ids it has not
///  seen acknowledged, and the window is wide enough to cover everything that can still
///  be in flight.
///
/// All id arithmetic wraps around the full 32-bit space, so the set keeps working when
///  a long-lived connection's packet counter rolls over.
pub struct IdSet {
    low: PacketId,
    /// width of the tracked range `[low, low+len)`; ids in it that are *not* in
    ///  `received` are still outstanding
    len: u32,
    /// received ids as offsets from `low`, each in `(0, len)` after compaction
    received: BTreeSet<u32>,
}

/// Ids further than this above `low` are outside the window. The peer never has more
///  than this many unacknowledged ids in flight, so an id out of window can only be a
///  stale duplicate.
pub const MAX_UNCONFIRMED_IDS: u32 = 1024;

impl IdSet {
    pub fn new() -> IdSet {
        Self::starting_at(PacketId::ZERO)
    }

    pub fn starting_at(low: PacketId) -> IdSet {
        IdSet {
            low,
            len: 0,
            received: BTreeSet::new(),
        }
    }

    pub fn add(&mut self, id: PacketId) {
        let offset = id.wrapping_offset_from(self.low);
        if offset >= MAX_UNCONFIRMED_IDS {
            // out of window - presumed already received and rolled past
            return;
        }

        if offset >= self.len {
            self.len = offset + 1;
        }
        self.received.insert(offset);
        self.compact();
    }

    pub fn contains(&self, id: PacketId) -> bool {
        let offset = id.wrapping_offset_from(self.low);
        if offset < self.len {
            self.received.contains(&offset)
        }
        else {
            // above the tracked range but inside the window: definitely not seen yet.
            // Outside the window: the id rolled past long ago.
            offset >= MAX_UNCONFIRMED_IDS
        }
    }

    /// true iff every id below `id` was received and none at or above it - this is the
    ///  "fully drained" check for a finished connection
    pub fn all_received_below(&self, id: PacketId) -> bool {
        self.received.is_empty() && self.len == 0 && self.low == id
    }

    /// advance `low` past the consecutive received ids at the start of the range
    fn compact(&mut self) {
        let mut run = 0u32;
        while self.received.contains(&run) {
            run += 1;
        }
        if run > 0 {
            self.low = self.low.wrapping_add(run);
            self.len -= run;
            let shifted = self.received.iter()
                .filter(|&&offset| offset >= run)
                .map(|offset| offset - run)
                .collect();
            self.received = shifted;
        }
    }
}

impl Default for IdSet {
    fn default() -> Self {
        Self::new()
    }
}
