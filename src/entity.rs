//! Entities: identified containers of components, owned by the `World`.
//!
//! `legion`'s `Entity` (the type this module is grounded on) is a cheap
//! `{index, version}` handle with no behavior of its own — all mutation goes
//! through `World` methods keyed by the handle. This engine follows the same
//! shape: [`EntityId`] is the handle a host holds onto, [`EntityRecord`] is
//! the world-owned storage behind it, and [`EntityRef`] (in `world.rs`) is
//! the ergonomic, `entity.add(...)`-style wrapper the spec's operations are
//! named after.
//!
//! Unlike `legion`, ids here are never recycled within a session (§4.6):
//! there is no free list, no generation counter, just a monotonically
//! increasing counter.

use std::fmt;

use fxhash::FxHashMap;

use crate::component::{Component, Message};
use crate::event::EventChannel;

/// A unique, non-reusable identifier for an entity within one `World`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EntityId(u64);

impl EntityId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        EntityId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.0)
    }
}

/// Args carried by component-lifecycle channels: `(entity, comp_id)`.
pub type CompEvent = (EntityId, crate::component::CompId);
/// Args carried by before/after-removal channels: `(entity, comp_id, will_destroy)`.
pub type RemovalEvent = (EntityId, crate::component::CompId, bool);

/// The live/deactivated/destroyed state machine described in §4.2:
/// `Live -> Deactivated <-> Live`, `Live -> Destroyed` (terminal).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LifecycleState {
    Live,
    Deactivated,
    Destroyed,
}

/// World-owned storage for one entity: its components, its messages for the
/// current frame, its place in the parent/child hierarchy, and its event
/// channels.
///
/// `EntityRecord` itself never calls back into the `World` — all
/// cross-cutting behavior (updating context membership, queuing watcher
/// notifications, deferring destruction) is driven by `World` methods that
/// hold `&mut` access to this record plus the rest of the world's tables at
/// the same time, which sidesteps the back-reference problem a
/// method-on-`Entity` design would otherwise have.
pub struct EntityRecord {
    pub(crate) id: EntityId,
    pub(crate) components: FxHashMap<crate::component::CompId, Box<dyn Component>>,
    pub(crate) messages: FxHashMap<crate::component::CompId, Box<dyn Message>>,
    pub(crate) parent: Option<EntityId>,
    pub(crate) children: FxHashMap<EntityId, Option<String>>,
    pub(crate) children_by_name: FxHashMap<String, EntityId>,

    pub(crate) destroyed: bool,
    pub(crate) deactivated: bool,
    pub(crate) deactivated_from_parent: bool,

    pub on_component_added: EventChannel<CompEvent>,
    pub on_component_before_modifying: EventChannel<CompEvent>,
    pub on_component_modified: EventChannel<CompEvent>,
    pub on_component_before_removing: EventChannel<RemovalEvent>,
    pub on_component_removed: EventChannel<RemovalEvent>,
    pub on_entity_activated: EventChannel<EntityId>,
    pub on_entity_deactivated: EventChannel<EntityId>,
    pub on_entity_destroyed: EventChannel<EntityId>,
    pub on_message: EventChannel<CompEvent>,
}

impl EntityRecord {
    pub(crate) fn new(id: EntityId) -> Self {
        EntityRecord {
            id,
            components: FxHashMap::default(),
            messages: FxHashMap::default(),
            parent: None,
            children: FxHashMap::default(),
            children_by_name: FxHashMap::default(),
            destroyed: false,
            deactivated: false,
            deactivated_from_parent: false,
            on_component_added: EventChannel::new(),
            on_component_before_modifying: EventChannel::new(),
            on_component_modified: EventChannel::new(),
            on_component_before_removing: EventChannel::new(),
            on_component_removed: EventChannel::new(),
            on_entity_activated: EventChannel::new(),
            on_entity_deactivated: EventChannel::new(),
            on_entity_destroyed: EventChannel::new(),
            on_message: EventChannel::new(),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn has(&self, comp_id: crate::component::CompId) -> bool {
        self.components.contains_key(&comp_id) || self.messages.contains_key(&comp_id)
    }

    pub fn lifecycle(&self) -> LifecycleState {
        if self.destroyed {
            LifecycleState::Destroyed
        } else if self.deactivated {
            LifecycleState::Deactivated
        } else {
            LifecycleState::Live
        }
    }

    /// Whether this entity's current deactivation was caused by a parent's
    /// deactivation cascading down, rather than a direct call (§3, §8 S4).
    pub fn was_deactivated_from_parent(&self) -> bool {
        self.deactivated_from_parent
    }

    pub fn parent(&self) -> Option<EntityId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = (EntityId, Option<&str>)> {
        self.children.iter().map(|(id, name)| (*id, name.as_deref()))
    }

    pub fn has_child(&self, id: EntityId) -> bool {
        self.children.contains_key(&id)
    }

    pub fn child_by_name(&self, name: &str) -> Option<EntityId> {
        self.children_by_name.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::CompId;

    #[derive(Debug)]
    struct Marker;
    impl Component for Marker {}

    #[derive(Debug)]
    struct Ping;
    impl crate::component::Message for Ping {}

    #[test]
    fn fresh_entity_has_no_components() {
        let record = EntityRecord::new(EntityId::from_raw(0));
        assert!(!record.has(CompId(0)));
        assert_eq!(record.lifecycle(), LifecycleState::Live);
    }

    #[test]
    fn has_checks_both_components_and_messages() {
        let mut record = EntityRecord::new(EntityId::from_raw(0));
        record.components.insert(CompId(1), Box::new(Marker));
        assert!(record.has(CompId(1)));
        assert!(!record.has(CompId(2)));

        record.messages.insert(CompId(2), Box::new(Ping));
        assert!(record.has(CompId(2)));
    }
}
