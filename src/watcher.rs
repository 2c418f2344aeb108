//! Reactive observers: [`ComponentWatcher`] coalesces per-component events
//! within a frame for later batched delivery; [`MessageWatcher`] forwards
//! messages to interested systems immediately.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use fxhash::FxHashMap;

use crate::component::CompId;
use crate::context::ContextId;
use crate::entity::EntityId;

/// The kind of reactive notification a [`ComponentWatcher`] coalesces.
///
/// Dispatch order within a system's bucket is always `Removed, Added,
/// Modified, Enabled, Disabled` (§4.6), so that a component removed and
/// re-added within the same frame is observed as a remove followed by an
/// add.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum NotificationKind {
    Added,
    Removed,
    Modified,
    Enabled,
    Disabled,
}

impl NotificationKind {
    pub const DISPATCH_ORDER: [NotificationKind; 5] = [
        NotificationKind::Removed,
        NotificationKind::Added,
        NotificationKind::Modified,
        NotificationKind::Enabled,
        NotificationKind::Disabled,
    ];
}

pub type WatcherId = u64;
pub type MessageWatcherId = u64;

pub fn component_watcher_id(context_id: ContextId, comp_id: CompId) -> WatcherId {
    let mut hasher = DefaultHasher::new();
    context_id.hash(&mut hasher);
    comp_id.hash(&mut hasher);
    hasher.finish()
}

pub fn message_watcher_id(context_id: ContextId, message_ids: &[CompId]) -> MessageWatcherId {
    let mut sorted = message_ids.to_vec();
    sorted.sort_unstable();

    let mut inner_hasher = DefaultHasher::new();
    sorted.hash(&mut inner_hasher);
    let inner = inner_hasher.finish();

    let mut hasher = DefaultHasher::new();
    context_id.hash(&mut hasher);
    inner.hash(&mut hasher);
    hasher.finish()
}

/// A per-`(context, component id)` observer. Buffers one notification per
/// entity per kind per frame; `pop_notifications` drains and clears the
/// buffer for the end-of-phase reactive drain (§4.6).
pub struct ComponentWatcher {
    pub id: WatcherId,
    pub context_id: ContextId,
    pub comp_id: CompId,
    buckets: FxHashMap<NotificationKind, FxHashMap<EntityId, ()>>,
}

impl ComponentWatcher {
    pub fn new(context_id: ContextId, comp_id: CompId) -> Self {
        ComponentWatcher {
            id: component_watcher_id(context_id, comp_id),
            context_id,
            comp_id,
            buckets: FxHashMap::default(),
        }
    }

    fn bucket(&mut self, kind: NotificationKind) -> &mut FxHashMap<EntityId, ()> {
        self.buckets.entry(kind).or_default()
    }

    fn is_empty(&self) -> bool {
        self.buckets.values().all(|b| b.is_empty())
    }

    /// Records a component add. Returns `true` if this is the watcher's
    /// first queued notification this frame (the caller should then mark
    /// the watcher as pending on the world).
    pub fn on_added(&mut self, entity: EntityId) -> bool {
        let was_empty = self.is_empty();
        self.bucket(NotificationKind::Added).insert(entity, ());
        was_empty
    }

    /// Records a component remove. If an `added` notification was queued
    /// for the same entity this frame, it is cancelled — the remove still
    /// fires (§4.4: "removal is still signalled since the component did
    /// exist mid-frame").
    pub fn on_removed(&mut self, entity: EntityId) -> bool {
        let was_empty = self.is_empty();
        self.bucket(NotificationKind::Added).remove(&entity);
        self.bucket(NotificationKind::Removed).insert(entity, ());
        was_empty
    }

    pub fn on_modified(&mut self, entity: EntityId) -> bool {
        let was_empty = self.is_empty();
        self.bucket(NotificationKind::Modified).insert(entity, ());
        was_empty
    }

    pub fn on_enabled(&mut self, entity: EntityId) -> bool {
        let was_empty = self.is_empty();
        self.bucket(NotificationKind::Enabled).insert(entity, ());
        was_empty
    }

    /// Records entity deactivation, with the "never born" cancellation rule:
    /// if `added` was queued this frame for this entity, the `added` is
    /// cancelled and no `disabled` is recorded at all.
    pub fn on_disabled(&mut self, entity: EntityId) -> bool {
        let was_empty = self.is_empty();
        if self.bucket(NotificationKind::Added).remove(&entity).is_some() {
            return false;
        }
        self.bucket(NotificationKind::Disabled).insert(entity, ());
        was_empty
    }

    /// Drains the buffer, filtering out entities destroyed before the pop —
    /// except under `Removed`, which must survive a concurrent destroy
    /// (§4.4).
    pub fn pop_notifications(
        &mut self,
        is_destroyed: impl Fn(EntityId) -> bool,
    ) -> FxHashMap<NotificationKind, Vec<EntityId>> {
        let mut out = FxHashMap::default();
        for kind in NotificationKind::DISPATCH_ORDER {
            let bucket = self.buckets.entry(kind).or_default();
            let mut entities: Vec<EntityId> = if kind == NotificationKind::Removed {
                bucket.keys().copied().collect()
            } else {
                bucket.keys().copied().filter(|e| !is_destroyed(*e)).collect()
            };
            entities.sort_unstable();
            bucket.clear();
            if !entities.is_empty() {
                out.insert(kind, entities);
            }
        }
        out
    }
}

/// A per-`(context, sorted message id set)` observer. Unlike
/// `ComponentWatcher`, messages are never coalesced: every send is dispatched
/// synchronously (§4.5).
pub struct MessageWatcher {
    pub id: MessageWatcherId,
    pub context_id: ContextId,
    target_message_ids: Vec<CompId>,
}

impl MessageWatcher {
    pub fn new(context_id: ContextId, message_ids: &[CompId]) -> Self {
        let mut target_message_ids = message_ids.to_vec();
        target_message_ids.sort_unstable();
        target_message_ids.dedup();
        MessageWatcher {
            id: message_watcher_id(context_id, &target_message_ids),
            context_id,
            target_message_ids,
        }
    }

    pub fn targets(&self, comp_id: CompId) -> bool {
        self.target_message_ids.binary_search(&comp_id).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_id() -> ContextId {
        use crate::context::FilterKind;
        use fxhash::FxHashMap as M;
        let mut target = M::default();
        target.insert(FilterKind::AllOf, vec![CompId(1)]);
        ContextId::compute(&target)
    }

    #[test]
    fn add_then_remove_cancels_added_but_keeps_removed() {
        let mut w = ComponentWatcher::new(ctx_id(), CompId(1));
        let e = EntityId::from_raw(1);
        w.on_added(e);
        w.on_removed(e);

        let popped = w.pop_notifications(|_| false);
        assert!(!popped.contains_key(&NotificationKind::Added));
        assert_eq!(popped[&NotificationKind::Removed], vec![e]);
    }

    #[test]
    fn add_then_disable_is_never_born() {
        let mut w = ComponentWatcher::new(ctx_id(), CompId(1));
        let e = EntityId::from_raw(1);
        w.on_added(e);
        w.on_disabled(e);

        let popped = w.pop_notifications(|_| false);
        assert!(popped.is_empty());
    }

    #[test]
    fn removed_survives_destroyed_filter() {
        let mut w = ComponentWatcher::new(ctx_id(), CompId(1));
        let e = EntityId::from_raw(1);
        w.on_removed(e);

        let popped = w.pop_notifications(|_| true);
        assert_eq!(popped[&NotificationKind::Removed], vec![e]);
    }

    #[test]
    fn modified_is_filtered_when_destroyed() {
        let mut w = ComponentWatcher::new(ctx_id(), CompId(1));
        let e = EntityId::from_raw(1);
        w.on_modified(e);

        let popped = w.pop_notifications(|_| true);
        assert!(popped.is_empty());
    }

    #[test]
    fn message_watcher_dedupes_and_sorts_targets() {
        let w = MessageWatcher::new(ctx_id(), &[CompId(5), CompId(2), CompId(5)]);
        assert!(w.targets(CompId(2)));
        assert!(w.targets(CompId(5)));
        assert!(!w.targets(CompId(9)));
    }
}
