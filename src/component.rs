//! Component and message identity.
//!
//! Every concrete component or message type is mapped to a stable, small
//! [`CompId`] the first time it is seen by a [`ComponentIndex`]. The mapping
//! never changes for the life of a `World`: once a type has an id, all future
//! lookups for that type return the same id.

use std::any::TypeId;
use std::fmt;

use downcast_rs::{impl_downcast, Downcast};
use fxhash::FxHashMap;
use tracing::trace;

/// Marker for types that can be stored as entity components.
///
/// A blanket impl is intentionally not provided: a type becomes a component
/// by explicitly implementing this trait, the same way `legion`'s `Component`
/// marker (`storage::Component`) is a deliberate opt-in rather than "anything
/// `'static`".
pub trait Component: Downcast + fmt::Debug {}
impl_downcast!(Component);

/// Marker for types delivered only for the frame in which they are sent.
///
/// A type is either a [`Component`] or a `Message`, never both — see
/// [`ComponentIndex::register`].
pub trait Message: Downcast + fmt::Debug {}
impl_downcast!(Message);

/// The three interfaces the original engine treats as pre-registered,
/// reserved component categories. Any concrete component type can declare
/// membership in one of these via [`ComponentIndex::register_interface_member`],
/// and is thereafter indistinguishable — for filtering purposes — from the
/// interface itself.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Interface {
    StateMachine,
    Interactive,
    Transform,
}

impl Interface {
    const ALL: [Interface; 3] = [
        Interface::StateMachine,
        Interface::Interactive,
        Interface::Transform,
    ];

    fn reserved_id(self) -> CompId {
        match self {
            Interface::StateMachine => CompId(0),
            Interface::Interactive => CompId(1),
            Interface::Transform => CompId(2),
        }
    }
}

/// A stable, small, non-negative id assigned to a component or message type.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct CompId(pub(crate) u32);

impl CompId {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CompId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum TypeCategory {
    Component,
    Message,
}

#[derive(Clone, Debug)]
struct TrackedEntry {
    id: CompId,
    type_name: &'static str,
    category: TypeCategory,
}

/// Process-wide (per-`World`) mapping from `Type` to [`CompId`].
///
/// Ids are assigned in two tiers: *tracked* ids are known at construction
/// (the three reserved interface ids, then explicitly registered component
/// types, then registered message types); *untracked* ids are assigned
/// lazily the first time an unregistered type is looked up, starting above
/// every tracked id. This mirrors `legion`'s `ComponentTypeId`/`TagTypeId`
/// split between statically-known storage layouts and ad-hoc lookups, here
/// simplified to a single flat id space since this engine does not need
/// `legion`'s archetype/chunk layout machinery.
pub struct ComponentIndex {
    by_type: FxHashMap<TypeId, TrackedEntry>,
    interface_members: FxHashMap<CompId, Vec<(TypeId, &'static str)>>,
    next_untracked: u32,
}

impl ComponentIndex {
    /// Builds a fresh index with the three reserved interface ids allocated
    /// (`StateMachine = 0`, `Interactive = 1`, `Transform = 2`), in that
    /// order, matching the original engine's reserved-id layout.
    pub fn new() -> Self {
        let mut interface_members = FxHashMap::default();
        for iface in Interface::ALL {
            interface_members.insert(iface.reserved_id(), Vec::new());
        }

        ComponentIndex {
            by_type: FxHashMap::default(),
            interface_members,
            next_untracked: Interface::ALL.len() as u32,
        }
    }

    /// Explicitly registers a concrete component type with the next tracked
    /// id. Intended to be called for every component type the host knows
    /// about up front, before the first untracked lookup — see
    /// `WorldConfig::register_component`.
    pub fn register_component<T: Component + 'static>(&mut self) -> CompId {
        self.register(TypeId::of::<T>(), std::any::type_name::<T>(), TypeCategory::Component)
    }

    /// Explicitly registers a concrete message type with the next tracked id.
    pub fn register_message<T: Message + 'static>(&mut self) -> CompId {
        self.register(TypeId::of::<T>(), std::any::type_name::<T>(), TypeCategory::Message)
    }

    fn register(&mut self, tid: TypeId, type_name: &'static str, category: TypeCategory) -> CompId {
        if let Some(existing) = self.by_type.get(&tid) {
            assert_eq!(
                existing.category, category,
                "type {type_name} already registered as {:?}, cannot re-register as {category:?}",
                existing.category
            );
            return existing.id;
        }

        let id = CompId(self.next_untracked);
        self.next_untracked += 1;
        self.by_type.insert(
            tid,
            TrackedEntry {
                id,
                type_name,
                category,
            },
        );
        trace!(?id, type_name, ?category, "registered tracked component/message type");
        id
    }

    /// Declares that concrete type `T` belongs to a reserved [`Interface`].
    /// Lookups for `T` thereafter resolve to the interface's reserved id
    /// rather than allocating a fresh untracked id, so filters written over
    /// the interface match every member.
    pub fn register_interface_member<T: Component + 'static>(&mut self, iface: Interface) {
        let tid = TypeId::of::<T>();
        let type_name = std::any::type_name::<T>();
        let id = iface.reserved_id();
        self.by_type.insert(
            tid,
            TrackedEntry {
                id,
                type_name,
                category: TypeCategory::Component,
            },
        );
        self.interface_members
            .entry(id)
            .or_default()
            .push((tid, type_name));
    }

    /// Returns the canonical id for component type `T`, assigning a fresh
    /// untracked id on first use if `T` was never registered.
    pub fn id_of<T: Component + 'static>(&mut self) -> CompId {
        self.id_for(TypeId::of::<T>(), std::any::type_name::<T>(), TypeCategory::Component)
    }

    /// Returns the canonical id for message type `T`, assigning a fresh
    /// untracked id on first use if `T` was never registered.
    pub fn id_of_message<T: Message + 'static>(&mut self) -> CompId {
        self.id_for(TypeId::of::<T>(), std::any::type_name::<T>(), TypeCategory::Message)
    }

    fn id_for(&mut self, tid: TypeId, type_name: &'static str, category: TypeCategory) -> CompId {
        if let Some(entry) = self.by_type.get(&tid) {
            return entry.id;
        }

        let id = CompId(self.next_untracked);
        self.next_untracked += 1;
        self.by_type.insert(
            tid,
            TrackedEntry {
                id,
                type_name,
                category,
            },
        );
        trace!(?id, type_name, ?category, "assigned untracked component/message id");
        id
    }

    /// Enumerates the tracked concrete component types registered as members
    /// of `iface`, most-recently-registered last.
    pub fn all_under_interface(&self, iface: Interface) -> Vec<(TypeId, &'static str)> {
        self.interface_members
            .get(&iface.reserved_id())
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of distinct ids assigned so far (tracked + untracked).
    pub fn total_indices(&self) -> usize {
        self.next_untracked as usize
    }

    /// Read-only id lookup: `None` if `T` has never been seen by this index,
    /// without assigning an untracked id as a side effect. Lets read-only
    /// `World` accessors (`get_component`, `has_component`) look up an id
    /// that must already exist — if any entity holds a value of type `T`,
    /// something already called `id_of::<T>()` to store it — without
    /// requiring `&mut self` themselves.
    pub fn try_id_of<T: Component + 'static>(&self) -> Option<CompId> {
        self.by_type.get(&TypeId::of::<T>()).map(|e| e.id)
    }

    /// Read-only id lookup for message types; see [`Self::try_id_of`].
    pub fn try_id_of_message<T: Message + 'static>(&self) -> Option<CompId> {
        self.by_type.get(&TypeId::of::<T>()).map(|e| e.id)
    }
}

impl Default for ComponentIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Position {
        #[allow(dead_code)]
        x: f32,
    }
    impl Component for Position {}

    #[derive(Debug)]
    struct Velocity;
    impl Component for Velocity {}

    #[derive(Debug)]
    struct Damage(u32);
    impl Message for Damage {}

    #[test]
    fn reserved_ids_are_stable() {
        let index = ComponentIndex::new();
        assert_eq!(index.total_indices(), 3);
    }

    #[test]
    fn repeated_lookups_return_same_id() {
        let mut index = ComponentIndex::new();
        let a = index.id_of::<Position>();
        let b = index.id_of::<Position>();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_types_get_distinct_ids() {
        let mut index = ComponentIndex::new();
        let pos = index.id_of::<Position>();
        let vel = index.id_of::<Velocity>();
        assert_ne!(pos, vel);
    }

    #[test]
    fn components_and_messages_share_disjoint_but_uniform_space() {
        let mut index = ComponentIndex::new();
        let pos = index.id_of::<Position>();
        let dmg = index.id_of_message::<Damage>();
        assert_ne!(pos, dmg);
    }

    #[test]
    fn interface_member_resolves_to_interface_id() {
        let mut index = ComponentIndex::new();
        index.register_interface_member::<Position>(Interface::Transform);
        assert_eq!(index.id_of::<Position>(), CompId(2));

        let members = index.all_under_interface(Interface::Transform);
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].1, std::any::type_name::<Position>());
    }

    #[test]
    fn untracked_ids_start_above_tracked_range() {
        let mut index = ComponentIndex::new();
        index.register_component::<Position>();
        index.register_message::<Damage>();
        let untracked = index.id_of::<Velocity>();
        assert_eq!(untracked, CompId(5));
    }
}
