//! Canonical entity subsets over a filter expression.
//!
//! A [`Context`] is the shared, canonical set of entities matching a filter.
//! Two systems that declare byte-identical filters (regardless of the order
//! they listed their types in) are handed the *same* context object by the
//! `World`, so membership bookkeeping and the derived watchers are only ever
//! computed once.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use fxhash::FxHashMap;

use crate::component::CompId;
use crate::entity::EntityId;
use crate::event::EventChannel;

/// The role a set of component ids plays in a filter.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum FilterKind {
    AllOf,
    AnyOf,
    NoneOf,
    /// An intentionally inert kind: a context declared `None` matches nothing.
    /// Used by systems that want a reactive subscription but no entity set
    /// of their own.
    None,
}

impl FilterKind {
    /// Ascending order used when building the context's canonical form.
    /// Negative markers (`-(kind as i64) - 1`, see [`ContextId::compute`])
    /// keep a kind discriminant from ever colliding with a `CompId` value
    /// in the hashed sequence.
    fn order(self) -> u8 {
        match self {
            FilterKind::AllOf => 0,
            FilterKind::AnyOf => 1,
            FilterKind::NoneOf => 2,
            FilterKind::None => 3,
        }
    }
}

/// Whether a filter declares read-only or read-write access to its
/// components. This is metadata for a future parallel scheduler; this
/// engine's single-threaded executor does not consult it.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum AccessKind {
    Read,
    Write,
}

/// One clause of a system's filter declaration, as supplied in system
/// metadata (§6 `FilterDecl`). `ReadWrite` access collapses to `Write` when
/// stored on the built [`Context`].
#[derive(Clone, Debug)]
pub struct FilterDecl {
    pub kind: FilterKind,
    pub access: FilterAccess,
    pub comp_ids: Vec<CompId>,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum FilterAccess {
    Read,
    Write,
    ReadWrite,
}

impl FilterAccess {
    fn collapse(self) -> AccessKind {
        match self {
            FilterAccess::Read => AccessKind::Read,
            FilterAccess::Write | FilterAccess::ReadWrite => AccessKind::Write,
        }
    }
}

/// Identifies a [`Context`] by the canonical form of its filter.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ContextId(u64);

impl ContextId {
    /// Computes the canonical id for a set of `(kind, sorted ids)` pairs.
    ///
    /// The sequence hashed is `[-kind, id+1, id+1, ...]` for each kind in
    /// ascending kind order, with ids sorted within a kind (see §4.3). The
    /// offset-by-one and negative markers only exist to keep a kind
    /// discriminant from colliding with a real `CompId` value in the hashed
    /// stream; the exact hash function is not load-bearing, only the
    /// canonical-form property is (§9).
    pub fn compute(target_components: &FxHashMap<FilterKind, Vec<CompId>>) -> ContextId {
        let mut kinds: Vec<&FilterKind> = target_components.keys().collect();
        kinds.sort_by_key(|k| k.order());

        let mut hasher = DefaultHasher::new();
        for kind in kinds {
            let marker: i64 = -(kind.order() as i64) - 1;
            marker.hash(&mut hasher);

            let mut ids: Vec<u32> = target_components[kind].iter().map(|c| c.index()).collect();
            ids.sort_unstable();
            for id in ids {
                (id as i64 + 1).hash(&mut hasher);
            }
        }
        ContextId(hasher.finish())
    }
}

/// Args carried by a context's re-emitted component channels:
/// `(entity, comp_id)`.
pub type CompEvent = (EntityId, CompId);
/// Args carried by a context's re-emitted before/after-removal channels:
/// `(entity, comp_id, will_destroy)`.
pub type RemovalEvent = (EntityId, CompId, bool);

/// The canonical entity subset matching one filter expression.
///
/// `Context` owns the membership bookkeeping (`entities` /
/// `deactivated_entities`) but not the entities themselves — those remain in
/// the `World`'s entity table. A `Context`'s channels mirror an entity's
/// event channels (§3), re-emitted only for members, so a host can observe
/// context-scoped activity without re-deriving membership itself.
pub struct Context {
    pub id: ContextId,
    pub target_components: FxHashMap<FilterKind, Vec<CompId>>,
    pub access_kinds: FxHashMap<AccessKind, Vec<CompId>>,
    pub entities: FxHashMap<EntityId, ()>,
    pub deactivated_entities: FxHashMap<EntityId, ()>,

    pub on_component_added_for_entity_in_context: EventChannel<CompEvent>,
    pub on_component_before_modifying_for_entity_in_context: EventChannel<CompEvent>,
    pub on_component_modified_for_entity_in_context: EventChannel<CompEvent>,
    pub on_component_before_removing_for_entity_in_context: EventChannel<RemovalEvent>,
    pub on_component_removed_for_entity_in_context: EventChannel<RemovalEvent>,
    pub on_activate_entity_in_context: EventChannel<EntityId>,
    pub on_deactivate_entity_in_context: EventChannel<EntityId>,
    pub on_message_sent_for_entity_in_context: EventChannel<CompEvent>,
}

impl Context {
    pub fn new(target_components: FxHashMap<FilterKind, Vec<CompId>>) -> Self {
        let id = ContextId::compute(&target_components);
        let access_kinds = FxHashMap::default();
        Context {
            id,
            target_components,
            access_kinds,
            entities: FxHashMap::default(),
            deactivated_entities: FxHashMap::default(),
            on_component_added_for_entity_in_context: EventChannel::new(),
            on_component_before_modifying_for_entity_in_context: EventChannel::new(),
            on_component_modified_for_entity_in_context: EventChannel::new(),
            on_component_before_removing_for_entity_in_context: EventChannel::new(),
            on_component_removed_for_entity_in_context: EventChannel::new(),
            on_activate_entity_in_context: EventChannel::new(),
            on_deactivate_entity_in_context: EventChannel::new(),
            on_message_sent_for_entity_in_context: EventChannel::new(),
        }
    }

    /// Builds the per-access-kind union from a system's filter declarations.
    /// `ReadWrite` collapses to `Write`, per §4.3.
    pub fn record_access(&mut self, decls: &[FilterDecl]) {
        for decl in decls {
            let kind = decl.access.collapse();
            let entry = self.access_kinds.entry(kind).or_default();
            for id in &decl.comp_ids {
                if !entry.contains(id) {
                    entry.push(*id);
                }
            }
        }
    }

    /// Builds `target_components` from a list of filter declarations,
    /// expanding interface types beforehand is the caller's responsibility
    /// (see `World::build_context`).
    pub fn target_components_from(decls: &[FilterDecl]) -> FxHashMap<FilterKind, Vec<CompId>> {
        let mut map: FxHashMap<FilterKind, Vec<CompId>> = FxHashMap::default();
        for decl in decls {
            let entry = map.entry(decl.kind).or_default();
            for id in &decl.comp_ids {
                if !entry.contains(id) {
                    entry.push(*id);
                }
            }
        }
        map
    }

    /// Evaluates the filter predicate against a snapshot of an entity's
    /// present component/message ids. A `None`-kind context always returns
    /// `false` (§4.3: "inert, matches nothing").
    pub fn matches(&self, present: &dyn Fn(CompId) -> bool) -> bool {
        if self.target_components.contains_key(&FilterKind::None) {
            return false;
        }

        if let Some(none_of) = self.target_components.get(&FilterKind::NoneOf) {
            if none_of.iter().any(|c| present(*c)) {
                return false;
            }
        }

        if let Some(all_of) = self.target_components.get(&FilterKind::AllOf) {
            if !all_of.iter().all(|c| present(*c)) {
                return false;
            }
        }

        if let Some(any_of) = self.target_components.get(&FilterKind::AnyOf) {
            if !any_of.is_empty() && !any_of.iter().any(|c| present(*c)) {
                return false;
            }
        }

        true
    }

    /// Every component/message id this context's predicate cares about —
    /// used by the `World` to know which contexts a mutation on a given
    /// `CompId` might affect, without re-evaluating every context on every
    /// mutation.
    pub fn relevant_comp_ids(&self) -> impl Iterator<Item = CompId> + '_ {
        self.target_components.values().flatten().copied()
    }

    pub fn is_active_member(&self, entity: EntityId) -> bool {
        self.entities.contains_key(&entity)
    }

    pub fn is_deactivated_member(&self, entity: EntityId) -> bool {
        self.deactivated_entities.contains_key(&entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[u32]) -> Vec<CompId> {
        ids.iter().map(|i| CompId(*i)).collect()
    }

    #[test]
    fn canonical_id_ignores_declaration_order() {
        let mut a = FxHashMap::default();
        a.insert(FilterKind::AllOf, ids(&[1, 2]));
        let mut b = FxHashMap::default();
        b.insert(FilterKind::AllOf, ids(&[2, 1]));

        assert_eq!(ContextId::compute(&a), ContextId::compute(&b));
    }

    #[test]
    fn different_kinds_with_same_ids_differ() {
        let mut a = FxHashMap::default();
        a.insert(FilterKind::AllOf, ids(&[1]));
        let mut b = FxHashMap::default();
        b.insert(FilterKind::AnyOf, ids(&[1]));

        assert_ne!(ContextId::compute(&a), ContextId::compute(&b));
    }

    #[test]
    fn none_kind_never_matches() {
        let mut target = FxHashMap::default();
        target.insert(FilterKind::None, Vec::new());
        let ctx = Context::new(target);
        assert!(!ctx.matches(&|_| true));
    }

    #[test]
    fn predicate_requires_all_any_none() {
        let mut target = FxHashMap::default();
        target.insert(FilterKind::AllOf, ids(&[1]));
        target.insert(FilterKind::AnyOf, ids(&[2, 3]));
        target.insert(FilterKind::NoneOf, ids(&[4]));
        let ctx = Context::new(target);

        let present = |c: CompId| matches!(c.index(), 1 | 2 | 5);
        assert!(ctx.matches(&present));

        let present_missing_all = |c: CompId| matches!(c.index(), 2);
        assert!(!ctx.matches(&present_missing_all));

        let present_with_none = |c: CompId| matches!(c.index(), 1 | 2 | 4);
        assert!(!ctx.matches(&present_with_none));
    }
}
