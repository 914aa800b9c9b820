//! The active list: entities that get simulated every tick.
//!
//! The scheduler never owns what it tracks. Each pass walks a snapshot of
//! the tracked handles, so simulation work may add, remove or destroy
//! entities (including the one being visited) without disturbing the walk.
//! Requested changes are queued and applied once the pass is over; handles
//! whose entity is gone are dropped without ever being dereferenced.

use crate::world::{Mobile, Shared};
use log::trace;
use shared::CacheKey;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::{Rc, Weak};

/// Tracking requests raised while a pass is running.
pub struct TrackingChanges<T> {
    track: Vec<Shared<T>>,
    untrack: Vec<Shared<T>>,
}

impl<T> Default for TrackingChanges<T> {
    fn default() -> Self {
        Self {
            track: Vec::new(),
            untrack: Vec::new(),
        }
    }
}

impl<T> TrackingChanges<T> {
    pub fn track(&mut self, entity: &Shared<T>) {
        self.track.push(entity.clone());
    }

    pub fn untrack(&mut self, entity: &Shared<T>) {
        self.untrack.push(entity.clone());
    }

    fn is_untracked(&self, entity: &Shared<T>) -> bool {
        self.untrack.iter().any(|e| Rc::ptr_eq(e, entity))
    }
}

/// Game-rule side of the scheduler.
pub trait Simulation<T> {
    /// Whether the entity still needs per-tick work given the observed rooms.
    fn requires_tracking(&self, entity: &T, observed: &HashSet<CacheKey>) -> bool;

    /// One unit of simulation work for a tracked entity.
    fn simulate(&mut self, entity: &Shared<T>, changes: &mut TrackingChanges<T>);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub simulated: usize,
    pub untracked: usize,
    /// Handles whose entity no longer existed
    pub dropped: usize,
}

pub struct EntityScheduler<T> {
    tracked: Vec<Weak<RefCell<T>>>,
}

impl<T> Default for EntityScheduler<T> {
    fn default() -> Self {
        Self {
            tracked: Vec::new(),
        }
    }
}

impl<T> EntityScheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking an entity; tracking it twice is a no-op.
    pub fn track(&mut self, entity: &Shared<T>) -> bool {
        if self.is_tracked(entity) {
            return false;
        }
        self.tracked.push(Rc::downgrade(entity));
        true
    }

    /// Stops tracking by identity; unknown entities are ignored.
    pub fn untrack(&mut self, entity: &Shared<T>) -> bool {
        let before = self.tracked.len();
        let target = Rc::as_ptr(entity);
        self.tracked.retain(|handle| handle.as_ptr() != target);
        self.tracked.len() != before
    }

    pub fn is_tracked(&self, entity: &Shared<T>) -> bool {
        let target = Rc::as_ptr(entity);
        self.tracked.iter().any(|handle| handle.as_ptr() == target)
    }

    /// Number of handles, including any that have not been pruned yet.
    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Live tracked entities in tracking order.
    pub fn live(&self) -> Vec<Shared<T>> {
        self.tracked.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn tick<S: Simulation<T> + ?Sized>(
        &mut self,
        sim: &mut S,
        observed: &HashSet<CacheKey>,
    ) -> TickReport {
        let mut report = TickReport::default();
        let mut changes = TrackingChanges::default();
        let snapshot = self.tracked.clone();

        for handle in snapshot {
            let Some(entity) = handle.upgrade() else {
                continue;
            };
            if changes.is_untracked(&entity) {
                continue;
            }
            let keep = sim.requires_tracking(&entity.borrow(), observed);
            if !keep {
                changes.untrack(&entity);
                report.untracked += 1;
                continue;
            }
            sim.simulate(&entity, &mut changes);
            report.simulated += 1;
        }

        for entity in &changes.untrack {
            self.untrack(entity);
        }
        for entity in &changes.track {
            if !changes.is_untracked(entity) {
                self.track(entity);
            }
        }

        let before = self.tracked.len();
        self.tracked.retain(|handle| handle.strong_count() > 0);
        report.dropped = before - self.tracked.len();

        if report.dropped > 0 {
            trace!("Active list dropped {} dangling handles", report.dropped);
        }
        report
    }
}

/// Default simulation for mobiles: slow regeneration while someone is
/// around to notice, or always for mobiles flagged as permanently active.
#[derive(Debug, Default)]
pub struct Regeneration;

impl Simulation<Mobile> for Regeneration {
    fn requires_tracking(&self, mobile: &Mobile, observed: &HashSet<CacheKey>) -> bool {
        mobile.always_active
            || mobile
                .room
                .as_ref()
                .map_or(false, |room| observed.contains(room))
    }

    fn simulate(&mut self, mobile: &Shared<Mobile>, _changes: &mut TrackingChanges<Mobile>) {
        let mut mobile = mobile.borrow_mut();
        if mobile.vitals.hp < mobile.vitals.max_hp {
            mobile.vitals.hp += 1;
        }
    }
}
