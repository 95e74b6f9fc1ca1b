/// What a session remembers about packets it already delivered.
///
/// Picked once at build time: [`KeepPackets`] when `keep_packets(true)`, otherwise
/// [`DropPackets`].
pub(crate) trait PacketHistory<P>: Send + Sync {
    /// Next packet behind the read cursor, advancing it.
    fn replay(&mut self) -> Option<P>;

    /// Stores a freshly decoded packet, optionally moving the cursor past it.
    fn retain(&mut self, packet: &P, advance_cursor: bool);

    fn get(&self, index: usize) -> Option<P>;

    fn len(&self) -> usize;

    /// Rewinds the cursor without dropping anything.
    fn reset(&mut self);

    /// Drops all retained packets and the cursor.
    fn clear(&mut self);

    fn supports_index(&self) -> bool;
}

pub(crate) fn for_mode<P>(keep_packets: bool) -> Box<dyn PacketHistory<P>>
where
    P: Clone + Send + Sync + 'static,
{
    if keep_packets {
        Box::new(KeepPackets::default())
    } else {
        Box::new(DropPackets)
    }
}

#[derive(Debug)]
pub(crate) struct KeepPackets<P> {
    packets: Vec<P>,
    cursor: usize,
}

impl<P> Default for KeepPackets<P> {
    fn default() -> Self {
        Self {
            packets: Vec::new(),
            cursor: 0,
        }
    }
}

impl<P: Clone + Send + Sync> PacketHistory<P> for KeepPackets<P> {
    fn replay(&mut self) -> Option<P> {
        let packet = self.packets.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(packet)
    }

    fn retain(&mut self, packet: &P, advance_cursor: bool) {
        self.packets.push(packet.clone());
        if advance_cursor {
            self.cursor = self.packets.len();
        }
    }

    fn get(&self, index: usize) -> Option<P> {
        self.packets.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.packets.len()
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn clear(&mut self) {
        self.packets.clear();
        self.cursor = 0;
    }

    fn supports_index(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub(crate) struct DropPackets;

impl<P> PacketHistory<P> for DropPackets {
    fn replay(&mut self) -> Option<P> {
        None
    }

    fn retain(&mut self, _packet: &P, _advance_cursor: bool) {}

    fn get(&self, _index: usize) -> Option<P> {
        None
    }

    fn len(&self) -> usize {
        0
    }

    fn reset(&mut self) {}

    fn clear(&mut self) {}

    fn supports_index(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_packets_replays_after_reset() {
        let mut history = for_mode::<u32>(true);
        history.retain(&1, true);
        history.retain(&2, true);
        assert_eq!(history.replay(), None);

        history.reset();
        assert_eq!(history.replay(), Some(1));
        assert_eq!(history.replay(), Some(2));
        assert_eq!(history.replay(), None);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn retain_without_advancing_leaves_packets_to_replay() {
        let mut history = for_mode::<u32>(true);
        history.retain(&7, false);
        assert_eq!(history.get(0), Some(7));
        assert_eq!(history.replay(), Some(7));
    }

    #[test]
    fn clear_drops_everything() {
        let mut history = for_mode::<u32>(true);
        history.retain(&1, true);
        history.clear();
        assert_eq!(history.len(), 0);
        assert_eq!(history.get(0), None);
    }

    #[test]
    fn drop_packets_never_retains() {
        let mut history = for_mode::<u32>(false);
        history.retain(&1, true);
        assert_eq!(history.len(), 0);
        assert_eq!(history.replay(), None);
        assert!(!history.supports_index());
    }
}
