//! Temporal buffers carry LOQ0 residual state from one frame to the next.
//!
//! The pool holds `num_temporal_buffers` buffers per plane. A frame that
//! needs prediction state issues a [`TemporalRequirement`] naming the
//! timestamp whose state it wants to read. Each buffer is attached to at
//! most one owner at a time. On release the buffer is tagged with the
//! releasing frame's timestamp and can be handed straight to the frame that
//! asked for exactly that state.
//!
//! Matching walks the whole pool. The pool is a few buffers per plane, so a
//! linear scan is all it needs.

use crate::{
    picture::{PlaneBuf, SharedPlane, shared_plane},
    types::{MAX_PLANES, Timestamp},
};
use core::fmt::Debug;
use tracing::{trace, warn};

/// What a frame needs from the temporal pool for one plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TemporalRequirement {
    pub(crate) plane: usize,
    /// State the frame wants to continue from. `None` before any frame
    /// produced state.
    pub(crate) timestamp: Option<Timestamp>,
    /// Content is irrelevant; the buffer starts from zero.
    pub(crate) clear: bool,
    pub(crate) width: u32,
    pub(crate) height: u32,
}

/// A buffer attached to an owner by [`TemporalPool::acquire`] or
/// [`TemporalPool::hand_over`].
///
/// The buffer is not usable until [`TemporalGrant::prepare`] has run.
#[derive(Debug, Clone)]
pub(crate) struct TemporalGrant {
    pub(crate) slot: usize,
    pub(crate) buffer: SharedPlane,
    /// Timestamp the buffer content represented when it was granted.
    pub(crate) previous: Option<Timestamp>,
}

#[derive(Debug)]
struct TemporalSlot<O> {
    plane: usize,
    /// Timestamp of the frame that last released the buffer.
    tag: Option<Timestamp>,
    owner: Option<O>,
    buffer: SharedPlane,
}

/// Fixed set of temporal buffers, `per_plane` for each of the
/// [`MAX_PLANES`] planes.
///
/// Owners are opaque handles; the pool only compares them.
#[derive(Debug)]
pub(crate) struct TemporalPool<O> {
    slots: Vec<TemporalSlot<O>>,
}

impl<O: Copy + Eq + Debug> TemporalPool<O> {
    pub(crate) fn new(per_plane: usize) -> Self {
        let slots = (0..MAX_PLANES)
            .flat_map(|plane| {
                (0..per_plane).map(move |_| TemporalSlot {
                    plane,
                    tag: None,
                    owner: None,
                    buffer: shared_plane(0, 0),
                })
            })
            .collect();
        Self { slots }
    }

    /// Find an idle buffer for `requirement` and attach it to `owner`.
    ///
    /// Preference order:
    /// 1. a buffer of the plane tagged with exactly the wanted timestamp;
    /// 2. for a clearing requirement, a buffer that has never been used;
    /// 3. for a clearing requirement, any idle buffer of the plane.
    ///
    /// Returns `None` when nothing matches. The requirement then waits for a
    /// release with the wanted tag.
    pub(crate) fn acquire(
        &mut self,
        owner: O,
        requirement: &TemporalRequirement,
    ) -> Option<TemporalGrant> {
        let idle = |slot: &TemporalSlot<O>| slot.owner.is_none() && slot.plane == requirement.plane;
        let exact = self
            .slots
            .iter()
            .position(|slot| idle(slot) && slot.tag == requirement.timestamp);
        let found = exact.or_else(|| {
            if !requirement.clear {
                return None;
            }
            self.slots
                .iter()
                .position(|slot| idle(slot) && slot.tag.is_none())
                .or_else(|| self.slots.iter().position(idle))
        })?;
        Some(self.hand_over(found, owner))
    }

    /// Whether the buffer in `slot` holds exactly the state `requirement`
    /// asks for.
    pub(crate) fn satisfies(&self, slot: usize, requirement: &TemporalRequirement) -> bool {
        self.slots.get(slot).is_some_and(|entry| {
            entry.plane == requirement.plane && entry.tag == requirement.timestamp
        })
    }

    /// Attach the buffer in `slot` to `owner`.
    pub(crate) fn hand_over(&mut self, slot: usize, owner: O) -> TemporalGrant {
        let entry = &mut self.slots[slot];
        debug_assert!(entry.owner.is_none(), "TemporalPool::hand_over: [1]");
        entry.owner = Some(owner);
        trace!(slot, plane = entry.plane, previous = ?entry.tag, ?owner, "temporal buffer attached");
        TemporalGrant {
            slot,
            buffer: entry.buffer.clone(),
            previous: entry.tag,
        }
    }

    /// Detach the buffer in `slot` from `owner` and tag it with `timestamp`.
    ///
    /// Returns `false` if `owner` did not hold it.
    pub(crate) fn release(&mut self, slot: usize, owner: O, timestamp: Timestamp) -> bool {
        let Some(entry) = self.slots.get_mut(slot) else {
            return false;
        };
        if entry.owner != Some(owner) {
            return false;
        }
        entry.owner = None;
        entry.tag = Some(timestamp);
        trace!(slot, plane = entry.plane, timestamp, "temporal buffer released");
        true
    }

    /// Detach every buffer held by `owner` without retagging.
    pub(crate) fn forget(&mut self, owner: O) {
        for entry in &mut self.slots {
            if entry.owner == Some(owner) {
                entry.owner = None;
            }
        }
    }

    /// Number of buffers attached to an owner.
    pub(crate) fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| slot.owner.is_some()).count()
    }
}

impl TemporalGrant {
    /// Bring the buffer to the requirement's size and content.
    ///
    /// Runs outside the pool lock: the grant gives the owner exclusive use.
    /// A size change reallocates (zeroed); if the frame expected earlier
    /// state this is logged since that state is lost.
    pub(crate) fn prepare(&self, requirement: &TemporalRequirement) {
        let mut buffer = self.buffer.lock();
        if !buffer.has_size(requirement.width, requirement.height) {
            if !requirement.clear && requirement.timestamp.is_some() && buffer.width() != 0 {
                warn!(
                    plane = requirement.plane,
                    wanted = ?requirement.timestamp,
                    got = ?(buffer.width(), buffer.height()),
                    expected = ?(requirement.width, requirement.height),
                    "temporal buffer size mismatch, reallocating"
                );
            }
            *buffer = PlaneBuf::new(requirement.width, requirement.height);
        } else if requirement.clear {
            buffer.fill(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn want(plane: usize, timestamp: Option<Timestamp>, clear: bool) -> TemporalRequirement {
        TemporalRequirement {
            plane,
            timestamp,
            clear,
            width: 4,
            height: 2,
        }
    }

    #[test]
    fn first_requirement_takes_untagged_buffer() {
        let mut pool = TemporalPool::<u32>::new(1);
        let grant = pool.acquire(1, &want(0, None, false)).unwrap();
        assert_eq!(grant.previous, None);
        assert_eq!(pool.in_use(), 1);
        // The only plane 0 buffer is attached now.
        assert!(pool.acquire(2, &want(0, None, true)).is_none());
        assert!(pool.acquire(2, &want(1, None, false)).is_some());
    }

    #[test]
    fn release_tags_buffer_for_exact_handoff() {
        let mut pool = TemporalPool::<u32>::new(2);
        let first = pool.acquire(1, &want(0, None, false)).unwrap();
        assert!(pool.release(first.slot, 1, 10));

        let next = want(0, Some(10), false);
        assert!(pool.satisfies(first.slot, &next));
        let grant = pool.acquire(2, &next).unwrap();
        assert_eq!(grant.slot, first.slot);
        assert_eq!(grant.previous, Some(10));
    }

    #[test]
    fn stale_buffer_only_serves_clearing_requirements() {
        let mut pool = TemporalPool::<u32>::new(1);
        let grant = pool.acquire(1, &want(0, None, false)).unwrap();
        pool.release(grant.slot, 1, 5);
        assert!(pool.acquire(2, &want(0, Some(7), false)).is_none());
        let cleared = pool.acquire(2, &want(0, Some(7), true)).unwrap();
        assert_eq!(cleared.previous, Some(5));
    }

    #[test]
    fn clearing_prefers_unused_buffers() {
        let mut pool = TemporalPool::<u32>::new(2);
        let grant = pool.acquire(1, &want(0, None, false)).unwrap();
        pool.release(grant.slot, 1, 3);
        let cleared = pool.acquire(2, &want(0, Some(9), true)).unwrap();
        assert_ne!(cleared.slot, grant.slot);
        assert_eq!(cleared.previous, None);
    }

    #[test]
    fn release_by_non_owner_is_ignored() {
        let mut pool = TemporalPool::<u32>::new(1);
        let grant = pool.acquire(1, &want(0, None, false)).unwrap();
        assert!(!pool.release(grant.slot, 2, 4));
        assert_eq!(pool.in_use(), 1);
        pool.forget(1);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn prepare_resizes_and_clears() {
        let mut pool = TemporalPool::<u32>::new(1);
        let requirement = want(0, None, false);
        let grant = pool.acquire(1, &requirement).unwrap();
        grant.prepare(&requirement);
        grant.buffer.lock().set(1, 1, 42);

        grant.prepare(&requirement);
        assert_eq!(grant.buffer.lock().get(1, 1), Some(42));

        grant.prepare(&TemporalRequirement {
            clear: true,
            ..requirement
        });
        assert_eq!(grant.buffer.lock().get(1, 1), Some(0));

        grant.prepare(&TemporalRequirement {
            width: 8,
            ..requirement
        });
        assert!(grant.buffer.lock().has_size(8, 2));
    }
}
