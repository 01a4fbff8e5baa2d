use crate::types::{Timestamp, compare_timestamps};
use core::cmp::Ordering;

#[derive(Debug, Clone, Copy)]
struct ReorderEntry<I> {
    timestamp: Timestamp,
    id: I,
    /// Eligible to leave the window regardless of its fill level.
    ready: bool,
}

/// Frames that have arrived but are not released to processing yet, kept
/// in timestamp order.
///
/// The front frame leaves once the window holds more than `max_reorder`
/// frames or once it has been marked ready. Frames always leave from the
/// front, so release order is timestamp order.
#[derive(Debug)]
pub(crate) struct ReorderWindow<I> {
    entries: Vec<ReorderEntry<I>>,
    max_reorder: usize,
}

impl<I: Copy> ReorderWindow<I> {
    pub(crate) fn new(max_reorder: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_reorder + 1),
            max_reorder,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Insert after every entry with an earlier or equal timestamp.
    pub(crate) fn insert(&mut self, timestamp: Timestamp, id: I, ready: bool) {
        let position = self
            .entries
            .iter()
            .position(|entry| compare_timestamps(entry.timestamp, timestamp) == Ordering::Greater)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            position,
            ReorderEntry {
                timestamp,
                id,
                ready,
            },
        );
    }

    /// Mark every frame at or before `timestamp` ready. Returns how many
    /// frames were marked.
    pub(crate) fn mark_ready_up_to(&mut self, timestamp: Timestamp) -> usize {
        let mut marked = 0;
        for entry in &mut self.entries {
            if compare_timestamps(entry.timestamp, timestamp) != Ordering::Greater {
                entry.ready = true;
                marked += 1;
            }
        }
        marked
    }

    /// Remove the front frame if it may leave the window.
    pub(crate) fn pop_ready(&mut self) -> Option<(Timestamp, I)> {
        let front = self.entries.first()?;
        if self.entries.len() > self.max_reorder || front.ready {
            let entry = self.entries.remove(0);
            return Some((entry.timestamp, entry.id));
        }
        None
    }

    /// Identifiers in timestamp order.
    #[cfg(test)]
    pub(crate) fn ids(&self) -> impl Iterator<Item = I> + '_ {
        self.entries.iter().map(|entry| entry.id)
    }

    /// Remove every frame.
    pub(crate) fn drain(&mut self) -> Vec<I> {
        self.entries.drain(..).map(|entry| entry.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_front_once_depth_is_exceeded() {
        let mut window = ReorderWindow::new(2);
        window.insert(20, 'b', false);
        window.insert(10, 'a', false);
        assert_eq!(window.pop_ready(), None);
        window.insert(30, 'c', false);
        assert_eq!(window.pop_ready(), Some((10, 'a')));
        assert_eq!(window.pop_ready(), None);
        assert_eq!(window.ids().collect::<Vec<_>>(), vec!['b', 'c']);
    }

    #[test]
    fn ready_frames_leave_in_order() {
        let mut window = ReorderWindow::new(16);
        for (ts, id) in [(3, 'c'), (1, 'a'), (2, 'b'), (4, 'd')] {
            window.insert(ts, id, false);
        }
        assert_eq!(window.mark_ready_up_to(2), 2);
        assert_eq!(window.pop_ready(), Some((1, 'a')));
        assert_eq!(window.pop_ready(), Some((2, 'b')));
        assert_eq!(window.pop_ready(), None);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn ready_frame_behind_unready_one_waits() {
        let mut window = ReorderWindow::new(16);
        window.insert(5, 'x', false);
        window.insert(6, 'y', true);
        assert_eq!(window.pop_ready(), None);
        assert_eq!(window.drain(), vec!['x', 'y']);
        assert_eq!(window.len(), 0);
    }

    #[test]
    fn ordering_survives_timestamp_wrap() {
        let mut window = ReorderWindow::new(16);
        window.insert(2, 'l', false);
        window.insert(u64::MAX, 'e', false);
        window.mark_ready_up_to(2);
        assert_eq!(window.pop_ready(), Some((u64::MAX, 'e')));
        assert_eq!(window.pop_ready(), Some((2, 'l')));
    }
}
