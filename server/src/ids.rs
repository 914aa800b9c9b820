//! Process-wide unique identifiers for in-world entities.
//!
//! The registry maps an identifier to a weak reference of the object that
//! claims it. Owners unregister an object when they tear it down; a lookup
//! of an object destroyed without that resolves to `None`. Counters only
//! ever grow and are written back only when they changed.

use crate::error::{Result, ServerError};
use crate::world::Shared;
use log::{info, warn};
use shared::{load_record_if_exists, store_record, Category, EntityId, IdCounters};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

/// An object that can carry a registry identifier.
pub trait Identified {
    fn category(&self) -> Category;
    fn id(&self) -> Option<EntityId>;
    fn set_id(&mut self, id: EntityId);
}

struct Mapping {
    object: Weak<dyn Any>,
    /// Address of the referent, used for identity comparison
    address: usize,
}

impl Mapping {
    fn is_alive(&self) -> bool {
        self.object.strong_count() > 0
    }
}

fn address_of<T>(object: &Shared<T>) -> usize {
    Rc::as_ptr(object) as *const () as usize
}

pub struct IdRegistry {
    counters: IdCounters,
    dirty: bool,
    mappings: HashMap<EntityId, Mapping>,
    path: PathBuf,
}

impl IdRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            counters: IdCounters::default(),
            dirty: false,
            mappings: HashMap::new(),
            path: path.into(),
        }
    }

    /// Restores counters from `path`, starting from zero if the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        let mut registry = IdRegistry::new(path);
        if let Some(counters) = load_record_if_exists::<IdCounters>(path)? {
            info!(
                "Loaded id counters M{} O{} P{}",
                counters.mobile, counters.item, counters.session
            );
            registry.counters = counters;
        }
        Ok(registry)
    }

    /// Writes the counters only if something was handed out since the last save.
    pub fn save_if_dirty(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        store_record(&self.path, &self.counters)?;
        self.dirty = false;
        Ok(true)
    }

    pub fn counters(&self) -> IdCounters {
        self.counters
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn next(&mut self, category: Category) -> EntityId {
        let counter = self.counters.get_mut(category);
        *counter += 1;
        self.dirty = true;
        EntityId::new(category, *counter)
    }

    /// Binds `object` to its identifier, assigning one if it has none.
    ///
    /// A conflicting live claim is healed for mobiles and items by taking a
    /// fresh identifier; for sessions it is returned as `IdentityConflict`.
    pub fn register<T: Identified + 'static>(&mut self, object: &Shared<T>) -> Result<EntityId> {
        let address = address_of(object);
        loop {
            let (category, current) = {
                let inner = object.borrow();
                (inner.category(), inner.id())
            };
            let id = match current {
                Some(id) => id,
                None => {
                    let id = self.next(category);
                    object.borrow_mut().set_id(id);
                    id
                }
            };

            let conflict = self
                .mappings
                .get(&id)
                .map_or(false, |existing| existing.is_alive() && existing.address != address);
            if !conflict {
                let weak: Weak<RefCell<T>> = Rc::downgrade(object);
                let weak: Weak<dyn Any> = weak;
                self.mappings.insert(
                    id,
                    Mapping {
                        object: weak,
                        address,
                    },
                );
                return Ok(id);
            }

            if !category.is_mutable() {
                warn!("Identity conflict on {}: already claimed by a live session", id);
                return Err(ServerError::IdentityConflict { id });
            }
            let fresh = self.next(category);
            warn!("Identity conflict on {}: reassigning as {}", id, fresh);
            object.borrow_mut().set_id(fresh);
        }
    }

    /// Removes the mapping for `id` if `object` is the one holding it.
    pub fn unregister<T: 'static>(&mut self, id: EntityId, object: &Shared<T>) -> bool {
        match self.mappings.get(&id) {
            None => {
                warn!("Unregister of {} which is not registered", id);
                false
            }
            Some(existing) if existing.address != address_of(object) => {
                warn!("Unregister of {} by an object that does not own it", id);
                false
            }
            Some(_) => {
                self.mappings.remove(&id);
                true
            }
        }
    }

    pub fn lookup<T: 'static>(&self, id: EntityId) -> Option<Shared<T>> {
        let strong = self.mappings.get(&id)?.object.upgrade()?;
        strong.downcast::<RefCell<T>>().ok()
    }

    /// Number of mappings held, dead referents included.
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    /// Number of mappings whose referent is still alive.
    pub fn live_count(&self) -> usize {
        self.mappings.values().filter(|m| m.is_alive()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{shared, Item, Mobile, Player, Role};
    use shared::CacheKey;
    use tempfile::tempdir;

    fn registry() -> IdRegistry {
        IdRegistry::new(std::env::temp_dir().join("unused-ids.bin"))
    }

    #[test]
    fn test_next_is_monotonic_per_category() {
        let mut ids = registry();
        assert!(!ids.is_dirty());
        assert_eq!(ids.next(Category::Mobile).to_string(), "M1");
        assert_eq!(ids.next(Category::Mobile).to_string(), "M2");
        assert_eq!(ids.next(Category::Item).to_string(), "O1");
        assert!(ids.is_dirty());
    }

    #[test]
    fn test_register_assigns_missing_id() {
        let mut ids = registry();
        let mobile = shared(Mobile::default());
        let id = ids.register(&mobile).unwrap();
        assert_eq!(mobile.borrow().id, Some(id));

        let found: Shared<Mobile> = ids.lookup(id).unwrap();
        assert!(Rc::ptr_eq(&found, &mobile));
    }

    #[test]
    fn test_conflicting_mobile_is_reassigned() {
        let mut ids = registry();
        let first = shared(Mobile::default());
        let first_id = ids.register(&first).unwrap();

        let second = shared(Mobile {
            id: Some(first_id),
            ..Mobile::default()
        });
        let second_id = ids.register(&second).unwrap();

        assert_ne!(first_id, second_id);
        let a: Shared<Mobile> = ids.lookup(first_id).unwrap();
        let b: Shared<Mobile> = ids.lookup(second_id).unwrap();
        assert!(Rc::ptr_eq(&a, &first));
        assert!(Rc::ptr_eq(&b, &second));
    }

    #[test]
    fn test_conflicting_session_is_rejected() {
        let mut ids = registry();
        let room = CacheKey::new("misc", 1);
        let first = shared(Player::new("Ann", Role::Player, room.clone()));
        let id = ids.register(&first).unwrap();

        let mut impostor = Player::new("Bob", Role::Player, room);
        impostor.id = Some(id);
        let impostor = shared(impostor);

        let err = ids.register(&impostor).unwrap_err();
        assert!(matches!(err, ServerError::IdentityConflict { .. }));
        let owner: Shared<Player> = ids.lookup(id).unwrap();
        assert!(Rc::ptr_eq(&owner, &first));
    }

    #[test]
    fn test_reregistering_same_object_is_stable() {
        let mut ids = registry();
        let item = shared(Item::default());
        let id = ids.register(&item).unwrap();
        assert_eq!(ids.register(&item).unwrap(), id);
        assert_eq!(ids.live_count(), 1);
    }

    #[test]
    fn test_dead_mapping_resolves_to_none_and_is_replaced() {
        let mut ids = registry();
        let item = shared(Item::default());
        let id = ids.register(&item).unwrap();
        drop(item);
        assert!(ids.lookup::<Item>(id).is_none());

        let successor = shared(Item {
            id: Some(id),
            ..Item::default()
        });
        assert_eq!(ids.register(&successor).unwrap(), id);
    }

    #[test]
    fn test_lookup_with_wrong_type_is_none() {
        let mut ids = registry();
        let item = shared(Item::default());
        let id = ids.register(&item).unwrap();
        assert!(ids.lookup::<Mobile>(id).is_none());
    }

    #[test]
    fn test_unregister_checks_owner() {
        let mut ids = registry();
        let owner = shared(Mobile::default());
        let other = shared(Mobile::default());
        let id = ids.register(&owner).unwrap();

        assert!(!ids.unregister(id, &other));
        assert!(ids.lookup::<Mobile>(id).is_some());
        assert!(ids.unregister(id, &owner));
        assert!(!ids.unregister(id, &owner));
        assert!(ids.lookup::<Mobile>(id).is_none());
    }

    #[test]
    fn test_counters_saved_only_when_dirty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.bin");

        let mut ids = IdRegistry::load(&path).unwrap();
        assert!(!ids.save_if_dirty().unwrap());
        assert!(!path.exists());

        ids.next(Category::Session);
        ids.next(Category::Session);
        assert!(ids.save_if_dirty().unwrap());
        assert!(!ids.save_if_dirty().unwrap());

        let reloaded = IdRegistry::load(&path).unwrap();
        assert_eq!(reloaded.counters().session, 2);
    }
}
