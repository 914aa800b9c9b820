//! In-world objects as the runtime core sees them.
//!
//! Game rules live elsewhere; these types carry only what the cache, the
//! scheduler, the id registry and the reboot path need to manipulate.

use crate::connection::ConnectionId;
use crate::ids::Identified;
use serde::{Deserialize, Serialize};
use shared::{CacheKey, Category, EntityId};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

/// Single-threaded shared ownership used for every live world object.
pub type Shared<T> = Rc<RefCell<T>>;

pub fn shared<T>(value: T) -> Shared<T> {
    Rc::new(RefCell::new(value))
}

/// Privilege level of a session; drives idle thresholds and command access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// Not yet logged in
    #[default]
    Guest,
    Player,
    Staff,
    Admin,
}

impl Role {
    pub fn is_staff(self) -> bool {
        self >= Role::Staff
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vitals {
    pub hp: i32,
    pub max_hp: i32,
    pub mp: i32,
    pub max_mp: i32,
}

impl Vitals {
    pub fn new(max_hp: i32, max_mp: i32) -> Self {
        Self {
            hp: max_hp,
            max_hp,
            mp: max_mp,
            max_mp,
        }
    }

    pub fn restore(&mut self) {
        self.hp = self.max_hp;
        self.mp = self.max_mp;
    }

    pub fn is_full(&self) -> bool {
        self.hp >= self.max_hp && self.mp >= self.max_mp
    }
}

impl Default for Vitals {
    fn default() -> Self {
        Vitals::new(20, 10)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Room {
    pub key: CacheKey,
    pub name: String,
    pub description: String,
    /// Mobile prototypes instantiated whenever the room is loaded
    pub mobile_spawns: Vec<CacheKey>,
    pub item_spawns: Vec<CacheKey>,
    /// Names of players currently standing here
    #[serde(skip)]
    pub occupants: BTreeSet<String>,
    #[serde(skip)]
    pub mobiles: Vec<Shared<Mobile>>,
    #[serde(skip)]
    pub items: Vec<Shared<Item>>,
}

impl Room {
    /// Placeholder used when storage has no description for a key.
    pub fn empty(key: &CacheKey) -> Self {
        Room {
            key: key.clone(),
            name: "The Void".to_string(),
            description: "Formless mist stretches in every direction.".to_string(),
            ..Room::default()
        }
    }

    pub fn is_observed(&self) -> bool {
        !self.occupants.is_empty()
    }

    /// Drops a mobile instance from the room by identity.
    pub fn remove_mobile(&mut self, mobile: &Shared<Mobile>) -> bool {
        let before = self.mobiles.len();
        self.mobiles.retain(|m| !Rc::ptr_eq(m, mobile));
        self.mobiles.len() != before
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mobile {
    pub id: Option<EntityId>,
    pub prototype: CacheKey,
    pub name: String,
    /// Keeps simulating even when nobody is watching
    pub always_active: bool,
    pub vitals: Vitals,
    #[serde(skip)]
    pub room: Option<CacheKey>,
}

impl Mobile {
    /// A fresh, unregistered copy of this prototype.
    pub fn instance(&self) -> Mobile {
        Mobile {
            id: None,
            room: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Item {
    pub id: Option<EntityId>,
    pub prototype: CacheKey,
    pub name: String,
}

impl Item {
    pub fn instance(&self) -> Item {
        Item {
            id: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: Option<EntityId>,
    pub name: String,
    pub role: Role,
    pub room: CacheKey,
    pub vitals: Vitals,
    /// Back-reference to the owning connection; never owns it
    #[serde(skip)]
    pub connection: Option<ConnectionId>,
}

impl Player {
    pub fn new(name: impl Into<String>, role: Role, room: CacheKey) -> Self {
        Self {
            id: None,
            name: name.into(),
            role,
            room,
            vitals: Vitals::default(),
            connection: None,
        }
    }
}

impl Identified for Mobile {
    fn category(&self) -> Category {
        Category::Mobile
    }
    fn id(&self) -> Option<EntityId> {
        self.id
    }
    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }
}

impl Identified for Item {
    fn category(&self) -> Category {
        Category::Item
    }
    fn id(&self) -> Option<EntityId> {
        self.id
    }
    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }
}

impl Identified for Player {
    fn category(&self) -> Category {
        Category::Session
    }
    fn id(&self) -> Option<EntityId> {
        self.id
    }
    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }
}
