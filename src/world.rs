//! The orchestrator: owns every entity, context, and watcher; drives the
//! phase methods a host calls each frame; drains the reactive queue to a
//! fixpoint after every phase body.
//!
//! Grounded in `legion_core::world::World` for the general shape (a single
//! owning store the host drives through phase-shaped calls) but not its
//! archetype/chunk storage — this engine's entities are individually boxed
//! (`EntityRecord`, §4.2) rather than packed into per-archetype column
//! storage, since the spec's component set is open-ended and per-entity
//! heterogeneous rather than known-at-compile-time tuples.

use fxhash::{FxHashMap, FxHashSet};
use itertools::Itertools;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::component::{CompId, Component, ComponentIndex, Interface, Message};
use crate::context::{Context, ContextId, FilterDecl, FilterKind};
use crate::entity::{EntityId, EntityRecord};
use crate::error::EcsError;
use crate::system::{Capability, NoopSystem, ReactiveBatch, Scope, System, SystemId, SystemMeta};
use crate::watcher::{component_watcher_id, message_watcher_id, ComponentWatcher, MessageWatcher, MessageWatcherId, NotificationKind, WatcherId};

/// Construction-time configuration, supplied once to [`World::new`] /
/// [`WorldBuilder::build`]. There is no file or environment configuration
/// surface (the engine is embedded, §6) — this is the analogous ambient
/// concern, mirroring how `legion`'s `Universe`/`World::new_in_universe`
/// take explicit parameters instead of reading global state.
#[derive(Clone, Debug)]
pub struct WorldConfig {
    /// Gates the extra runtime assertions named in §7/§8 (uniqueness
    /// checks, double-destroy guards). Defaults to the `diagnostics` Cargo
    /// feature being enabled, but can be overridden per-`World` (e.g. to
    /// turn diagnostics on in a release-mode test without the feature).
    pub diagnostics: bool,
    /// Capacity hint for the entity table, passed straight to the backing
    /// map's `with_capacity_and_hasher`.
    pub entity_capacity_hint: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        WorldConfig {
            diagnostics: cfg!(feature = "diagnostics"),
            entity_capacity_hint: 0,
        }
    }
}

struct SystemEntry {
    meta: SystemMeta,
    system: Box<dyn System>,
    active: bool,
    context_id: Option<ContextId>,
    component_watcher_ids: Vec<WatcherId>,
    message_watcher_id: Option<MessageWatcherId>,
}

/// Incrementally built set of `(SystemMeta, Box<dyn System>, initially_active)`
/// triples, mirroring `legion_core::world::World::new` plus `bevy_app`'s
/// `AppBuilder`'s incremental-registration shape (§6.1): a host can register
/// systems one at a time instead of only through one bulk constructor call.
pub struct WorldBuilder {
    config: WorldConfig,
    index: ComponentIndex,
    pending: Vec<(SystemMeta, Box<dyn System>, bool)>,
}

impl WorldBuilder {
    pub fn new(config: WorldConfig) -> Self {
        WorldBuilder {
            config,
            index: ComponentIndex::new(),
            pending: Vec::new(),
        }
    }

    pub fn register_component<T: Component + 'static>(&mut self) -> &mut Self {
        self.index.register_component::<T>();
        self
    }

    pub fn register_message<T: Message + 'static>(&mut self) -> &mut Self {
        self.index.register_message::<T>();
        self
    }

    pub fn register_interface_member<T: Component + 'static>(&mut self, iface: Interface) -> &mut Self {
        self.index.register_interface_member::<T>(iface);
        self
    }

    /// Resolves `T`'s `CompId` against this builder's in-progress
    /// `ComponentIndex`, so a host can fill in a system's `FilterDecl`s or
    /// `watched_components` before that system is handed to [`Self::add_system`]
    /// (§6 "filters ... required for any system that reads entities").
    pub fn component_id<T: Component + 'static>(&mut self) -> CompId {
        self.index.id_of::<T>()
    }

    /// Resolves `T`'s `CompId` for a message type; see [`Self::component_id`].
    pub fn message_id<T: Message + 'static>(&mut self) -> CompId {
        self.index.id_of_message::<T>()
    }

    /// Queues a system for registration, in declaration order. Registration
    /// (context/watcher construction, `BadMetadata` validation) happens in
    /// [`WorldBuilder::build`], once every system's filters can be resolved
    /// against the fully-populated `ComponentIndex`.
    pub fn add_system(&mut self, meta: SystemMeta, system: impl System + 'static, initially_active: bool) -> &mut Self {
        self.pending.push((meta, Box::new(system), initially_active));
        self
    }

    pub fn build(self) -> Result<World, EcsError> {
        World::assemble(self.config, self.index, self.pending)
    }
}

/// Owns the `ComponentIndex`, the entity table, the context table, the
/// watcher tables, the system table, and every piece of pending-phase
/// bookkeeping (§3 "World").
pub struct World {
    config: WorldConfig,
    index: ComponentIndex,

    entities: FxHashMap<EntityId, EntityRecord>,
    next_entity_id: u64,

    contexts: FxHashMap<ContextId, Context>,
    /// `CompId -> contexts whose filter criteria mention it`, consulted to
    /// know which contexts might need a membership re-evaluation after a
    /// mutation on that id.
    comp_to_filter_contexts: FxHashMap<CompId, Vec<ContextId>>,
    /// `EntityId -> (ContextId -> is_active_member)`, the live membership
    /// table §4.3's invariant is checked against.
    entity_memberships: FxHashMap<EntityId, FxHashMap<ContextId, bool>>,

    component_watchers: FxHashMap<WatcherId, ComponentWatcher>,
    context_component_watchers: FxHashMap<ContextId, Vec<WatcherId>>,
    watcher_subscribers: FxHashMap<WatcherId, Vec<SystemId>>,

    message_watchers: FxHashMap<MessageWatcherId, MessageWatcher>,
    context_message_watchers: FxHashMap<ContextId, Vec<MessageWatcherId>>,
    message_watcher_subscribers: FxHashMap<MessageWatcherId, Vec<SystemId>>,

    context_activation_listeners: FxHashMap<ContextId, Vec<SystemId>>,

    systems: Vec<SystemEntry>,
    system_names: FxHashMap<&'static str, SystemId>,
    phase_lists: FxHashMap<Capability, Vec<SystemId>>,

    pending_destroy: SmallVec<[EntityId; 8]>,
    pending_activate: Vec<SystemId>,
    pending_deactivate: Vec<SystemId>,
    watchers_triggered: Vec<WatcherId>,
    watchers_triggered_set: FxHashSet<WatcherId>,
    messaged_entities: FxHashSet<EntityId>,

    unique_components: FxHashSet<CompId>,
    keep_on_replace: FxHashSet<CompId>,
    requires: FxHashMap<CompId, Vec<CompId>>,

    is_paused: bool,
    is_exiting: bool,
    paused_systems_remembered: Vec<SystemId>,
}

impl World {
    pub fn builder(config: WorldConfig) -> WorldBuilder {
        WorldBuilder::new(config)
    }

    /// Bulk constructor matching §3/§4.6's "the host supplies a list of
    /// `(system_meta, initially_active)` pairs, in declaration order" — for
    /// hosts that already have their full system list assembled rather than
    /// building it up incrementally via [`WorldBuilder`].
    pub fn new(
        config: WorldConfig,
        index: ComponentIndex,
        systems: Vec<(SystemMeta, Box<dyn System>, bool)>,
    ) -> Result<World, EcsError> {
        World::assemble(config, index, systems)
    }

    fn assemble(
        config: WorldConfig,
        index: ComponentIndex,
        systems: Vec<(SystemMeta, Box<dyn System>, bool)>,
    ) -> Result<World, EcsError> {
        let entity_capacity_hint = config.entity_capacity_hint;
        let mut world = World {
            config,
            index,
            entities: FxHashMap::with_capacity_and_hasher(entity_capacity_hint, Default::default()),
            next_entity_id: 0,
            contexts: FxHashMap::default(),
            comp_to_filter_contexts: FxHashMap::default(),
            entity_memberships: FxHashMap::default(),
            component_watchers: FxHashMap::default(),
            context_component_watchers: FxHashMap::default(),
            watcher_subscribers: FxHashMap::default(),
            message_watchers: FxHashMap::default(),
            context_message_watchers: FxHashMap::default(),
            message_watcher_subscribers: FxHashMap::default(),
            context_activation_listeners: FxHashMap::default(),
            systems: Vec::new(),
            system_names: FxHashMap::default(),
            phase_lists: FxHashMap::default(),
            pending_destroy: SmallVec::new(),
            pending_activate: Vec::new(),
            pending_deactivate: Vec::new(),
            watchers_triggered: Vec::new(),
            watchers_triggered_set: FxHashSet::default(),
            messaged_entities: FxHashSet::default(),
            unique_components: FxHashSet::default(),
            keep_on_replace: FxHashSet::default(),
            requires: FxHashMap::default(),
            is_paused: false,
            is_exiting: false,
            paused_systems_remembered: Vec::new(),
        };

        for (meta, system, initially_active) in systems {
            world.register_system(meta, system, initially_active)?;
        }

        Ok(world)
    }

    // ---------------------------------------------------------------
    // Component metadata (§6 "Component metadata")
    // ---------------------------------------------------------------

    pub fn component_id<T: Component + 'static>(&mut self) -> CompId {
        self.index.id_of::<T>()
    }

    pub fn message_id<T: Message + 'static>(&mut self) -> CompId {
        self.index.id_of_message::<T>()
    }

    /// Marks a component id `unique`: at most one non-destroyed entity may
    /// hold it. Only consulted when `config.diagnostics` is on (§7
    /// `UniquenessViolation`, diagnostics-only).
    pub fn mark_unique(&mut self, comp_id: CompId) {
        self.unique_components.insert(comp_id);
    }

    /// Marks a component id `keep_on_replace`: survives a wholesale
    /// `replace` with `wipe = true` (§4.2).
    pub fn mark_keep_on_replace(&mut self, comp_id: CompId) {
        self.keep_on_replace.insert(comp_id);
    }

    /// Records `comp_id`'s declared `requires` list. Diagnostics-only
    /// warning: the engine does not auto-add required components (§6).
    pub fn mark_requires(&mut self, comp_id: CompId, required: Vec<CompId>) {
        self.requires.insert(comp_id, required);
    }

    fn check_requires(&self, entity: &EntityRecord, comp_id: CompId) {
        if !self.config.diagnostics {
            return;
        }
        if let Some(required) = self.requires.get(&comp_id) {
            for req in required {
                if !entity.has(*req) {
                    warn!(entity = %entity.id(), ?comp_id, ?req, "component added without its declared requirement present");
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // System registration (§4.6, §6 "System metadata record")
    // ---------------------------------------------------------------

    fn register_system(&mut self, meta: SystemMeta, system: Box<dyn System>, initially_active: bool) -> Result<SystemId, EcsError> {
        let sid = SystemId(self.systems.len() as u32);

        meta.validate().map_err(|reason| EcsError::BadMetadata {
            system: sid,
            name: meta.name,
            reason,
        })?;

        let needs_context = !meta.filters.is_empty()
            || meta.capabilities.contains(Capability::Reactive)
            || meta.capabilities.contains(Capability::ActivationListener);

        let context_id = if needs_context {
            Some(self.get_or_create_context(&meta.filters))
        } else {
            None
        };

        let mut component_watcher_ids = Vec::new();
        if meta.capabilities.contains(Capability::Reactive) {
            let ctx_id = context_id.expect("Reactive systems always resolve a context");
            let watched = self.expand_watched_components(&meta.watched_components);
            self.register_relevant_comp_ids(ctx_id, &watched);
            for comp_id in watched {
                let watcher_id = self.get_or_create_component_watcher(ctx_id, comp_id);
                component_watcher_ids.push(watcher_id);
                self.watcher_subscribers.entry(watcher_id).or_default().push(sid);
            }
        }

        let message_watcher_id = if meta.capabilities.contains(Capability::Messager) {
            let ctx_id = context_id.expect("Messager systems always resolve a context");
            let watcher_id = self.get_or_create_message_watcher(ctx_id, &meta.watched_messages);
            self.message_watcher_subscribers.entry(watcher_id).or_default().push(sid);
            Some(watcher_id)
        } else {
            None
        };

        if meta.capabilities.contains(Capability::ActivationListener) {
            let ctx_id = context_id.expect("ActivationListener systems always resolve a context");
            self.context_activation_listeners.entry(ctx_id).or_default().push(sid);
        }

        for cap in [
            Capability::EarlyStartup,
            Capability::Startup,
            Capability::Exit,
            Capability::Update,
            Capability::LateUpdate,
            Capability::FixedUpdate,
            Capability::Render,
        ] {
            if meta.capabilities.contains(cap) {
                self.phase_lists.entry(cap).or_default().push(sid);
            }
        }

        debug!(system = meta.name, id = sid.index(), "registered system");
        self.system_names.insert(meta.name, sid);
        self.systems.push(SystemEntry {
            meta,
            system,
            active: initially_active,
            context_id,
            component_watcher_ids,
            message_watcher_id,
        });

        Ok(sid)
    }

    /// Expands interface-marker ids (§4.1: "any subtype of the Interactive
    /// marker resolves to the Interactive id") is already folded into id
    /// resolution at the call site that produced `watched_components` — this
    /// just deduplicates.
    fn expand_watched_components(&self, comp_ids: &[CompId]) -> Vec<CompId> {
        let mut out = comp_ids.to_vec();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Resolves a system's filter declarations to a shared [`Context`],
    /// building a fresh one only if no context with the same canonical
    /// `target_components` already exists (§4.3 "two contexts with
    /// identical target_components must be the same object").
    fn get_or_create_context(&mut self, decls: &[FilterDecl]) -> ContextId {
        let target_components = Context::target_components_from(decls);
        self.build_or_reuse_context(target_components, decls)
    }

    /// Ad-hoc context constructor for `(kind, ids)` lookups that don't come
    /// from a system's filter list — e.g. `get_unique` (§4.3 constructor 2).
    pub(crate) fn get_or_create_ad_hoc_context(&mut self, kind: FilterKind, comp_ids: Vec<CompId>) -> ContextId {
        let mut target_components = FxHashMap::default();
        target_components.insert(kind, comp_ids);
        self.build_or_reuse_context(target_components, &[])
    }

    fn build_or_reuse_context(&mut self, target_components: FxHashMap<FilterKind, Vec<CompId>>, decls: &[FilterDecl]) -> ContextId {
        let id = ContextId::compute(&target_components);
        if self.contexts.contains_key(&id) {
            if let Some(ctx) = self.contexts.get_mut(&id) {
                ctx.record_access(decls);
            }
            return id;
        }

        let mut ctx = Context::new(target_components);
        ctx.record_access(decls);

        let relevant: Vec<CompId> = ctx.relevant_comp_ids().collect();
        for comp_id in relevant {
            let bucket = self.comp_to_filter_contexts.entry(comp_id).or_default();
            if !bucket.contains(&id) {
                bucket.push(id);
            }
        }

        // Backfill membership against every already-live entity: a context
        // created after entities already exist must still reflect them.
        let mut newly_active: Vec<EntityId> = Vec::new();
        let mut newly_deactivated: Vec<EntityId> = Vec::new();
        for (eid, record) in self.entities.iter() {
            if record.destroyed {
                continue;
            }
            if ctx.matches(&|c| record.has(c)) {
                if record.deactivated {
                    newly_deactivated.push(*eid);
                } else {
                    newly_active.push(*eid);
                }
            }
        }
        for eid in &newly_active {
            ctx.entities.insert(*eid, ());
            self.entity_memberships.entry(*eid).or_default().insert(id, true);
        }
        for eid in &newly_deactivated {
            ctx.deactivated_entities.insert(*eid, ());
            self.entity_memberships.entry(*eid).or_default().insert(id, false);
        }

        trace!(context = ?id, "built new context");
        self.contexts.insert(id, ctx);
        id
    }

    fn get_or_create_component_watcher(&mut self, ctx_id: ContextId, comp_id: CompId) -> WatcherId {
        let watcher_id = component_watcher_id(ctx_id, comp_id);
        self.component_watchers
            .entry(watcher_id)
            .or_insert_with(|| ComponentWatcher::new(ctx_id, comp_id));
        let bucket = self.context_component_watchers.entry(ctx_id).or_default();
        if !bucket.contains(&watcher_id) {
            bucket.push(watcher_id);
        }
        watcher_id
    }

    fn get_or_create_message_watcher(&mut self, ctx_id: ContextId, message_ids: &[CompId]) -> MessageWatcherId {
        let watcher_id = message_watcher_id(ctx_id, message_ids);
        self.message_watchers
            .entry(watcher_id)
            .or_insert_with(|| MessageWatcher::new(ctx_id, message_ids));
        let bucket = self.context_message_watchers.entry(ctx_id).or_default();
        if !bucket.contains(&watcher_id) {
            bucket.push(watcher_id);
        }
        watcher_id
    }

    pub fn context_by_id(&self, id: ContextId) -> Option<&Context> {
        self.contexts.get(&id)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn watcher_count(&self) -> usize {
        self.component_watchers.len() + self.message_watchers.len()
    }

    pub fn system_id_of(&self, name: &str) -> Option<SystemId> {
        self.system_names.get(name).copied()
    }

    pub fn is_system_active(&self, sid: SystemId) -> bool {
        self.systems.get(sid.index() as usize).map(|e| e.active).unwrap_or(false)
    }

    // ---------------------------------------------------------------
    // Entity lifecycle (§4.2)
    // ---------------------------------------------------------------

    pub fn add_entity(&mut self) -> EntityId {
        self.add_entity_with_id(None)
    }

    /// `id = Some(_)` is the "`id?`" parameter of §6's `add_entity`, used to
    /// preserve an externally-assigned id. A collision with an id already
    /// in this `World` is a host bug; it is logged and a fresh id is
    /// allocated instead rather than silently overwriting the existing
    /// entity.
    pub fn add_entity_with_id(&mut self, id: Option<EntityId>) -> EntityId {
        let id = match id {
            Some(requested) if !self.entities.contains_key(&requested) => {
                self.next_entity_id = self.next_entity_id.max(requested.raw() + 1);
                requested
            }
            Some(requested) => {
                warn!(requested = %requested, "add_entity_with_id: id already in use, allocating a fresh one");
                self.allocate_entity_id()
            }
            None => self.allocate_entity_id(),
        };

        trace!(entity = %id, "entity created");
        self.entities.insert(id, EntityRecord::new(id));
        id
    }

    fn allocate_entity_id(&mut self) -> EntityId {
        loop {
            let candidate = EntityId::from_raw(self.next_entity_id);
            self.next_entity_id += 1;
            if !self.entities.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn get_entity(&self, id: EntityId) -> &EntityRecord {
        self.entities.get(&id).expect("entity id not found in this world")
    }

    pub fn try_get_entity(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&id)
    }

    pub fn get_all_entities(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    /// Linear scan for every live entity holding all of `comp_ids` — a
    /// convenience built on the same `all_of` semantics as a system filter,
    /// without registering a context (§6 `get_entities_with`).
    pub fn get_entities_with(&self, comp_ids: &[CompId]) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|e| !e.destroyed && comp_ids.iter().all(|c| e.has(*c)))
            .map(|e| e.id())
            .collect()
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<EntityMut<'_>> {
        if self.entities.contains_key(&id) {
            Some(EntityMut { world: self, id })
        } else {
            None
        }
    }

    /// Cached `any_of [T]` unique lookup (§4.6). Panics if none match —
    /// callers that want an `Option` should use
    /// [`World::try_get_unique_entity`].
    pub fn get_unique<T: Component + 'static>(&mut self) -> EntityId {
        self.try_get_unique_entity::<T>().expect("get_unique: no entity found with this component")
    }

    pub fn try_get_unique_entity<T: Component + 'static>(&mut self) -> Option<EntityId> {
        let comp_id = self.index.id_of::<T>();
        let ctx_id = self.get_or_create_ad_hoc_context(FilterKind::AnyOf, vec![comp_id]);
        let ctx = self.contexts.get(&ctx_id)?;
        let mut live = ctx.entities.keys().filter(|id| {
            self.entities.get(id).map(|e| !e.destroyed).unwrap_or(false)
        });
        let first = live.next().copied();
        if self.config.diagnostics {
            let count = ctx
                .entities
                .keys()
                .filter(|id| self.entities.get(id).map(|e| !e.destroyed).unwrap_or(false))
                .count();
            assert!(count <= 1, "UniquenessViolation: {count} non-destroyed entities hold a component declared unique");
        }
        first
    }

    // ---------------------------------------------------------------
    // Context membership + reactive dispatch plumbing
    // ---------------------------------------------------------------

    fn queue_watcher_notification(&mut self, watcher_id: WatcherId) {
        if self.watchers_triggered_set.insert(watcher_id) {
            self.watchers_triggered.push(watcher_id);
        }
    }

    /// Re-evaluates membership in every context whose filter mentions
    /// `comp_id`, for one entity, after a component add/remove.
    fn recompute_membership_for(&mut self, entity_id: EntityId, comp_id: CompId) {
        let ctx_ids = self.comp_to_filter_contexts.get(&comp_id).cloned().unwrap_or_default();
        for ctx_id in ctx_ids {
            self.update_single_context_membership(entity_id, ctx_id);
        }
    }

    /// Folds extra comp ids (e.g. a filterless Reactive system's watched
    /// components) into a context's membership-trigger set and backfills
    /// membership over every live entity, so the context starts tracking
    /// entities even though those ids never appeared in its `target_components`.
    fn register_relevant_comp_ids(&mut self, ctx_id: ContextId, comp_ids: &[CompId]) {
        for comp_id in comp_ids {
            let bucket = self.comp_to_filter_contexts.entry(*comp_id).or_default();
            if !bucket.contains(&ctx_id) {
                bucket.push(ctx_id);
            }
        }
        let entity_ids: Vec<EntityId> = self.entities.keys().copied().collect();
        for entity_id in entity_ids {
            self.update_single_context_membership(entity_id, ctx_id);
        }
    }

    fn update_single_context_membership(&mut self, entity_id: EntityId, ctx_id: ContextId) {
        let record = match self.entities.get(&entity_id) {
            Some(r) => r,
            None => return,
        };
        let now_matches = !record.destroyed
            && self
                .contexts
                .get(&ctx_id)
                .map(|ctx| ctx.matches(&|c| record.has(c)))
                .unwrap_or(false);
        let is_active = !record.deactivated && !record.destroyed;

        let was_member = self.entity_memberships.get(&entity_id).and_then(|m| m.get(&ctx_id)).copied();

        match (was_member, now_matches) {
            (None, true) => {
                if let Some(ctx) = self.contexts.get_mut(&ctx_id) {
                    if is_active {
                        ctx.entities.insert(entity_id, ());
                    } else {
                        ctx.deactivated_entities.insert(entity_id, ());
                    }
                }
                self.entity_memberships.entry(entity_id).or_default().insert(ctx_id, is_active);
            }
            (Some(_), false) => {
                if let Some(ctx) = self.contexts.get_mut(&ctx_id) {
                    ctx.entities.remove(&entity_id);
                    ctx.deactivated_entities.remove(&entity_id);
                }
                if let Some(m) = self.entity_memberships.get_mut(&entity_id) {
                    m.remove(&ctx_id);
                }
            }
            _ => {}
        }
    }

    /// Moves an entity between a context's `entities`/`deactivated_entities`
    /// buckets on activate/deactivate, without touching match status.
    fn move_entity_active_buckets(&mut self, entity_id: EntityId, now_active: bool) {
        let ctx_ids: Vec<ContextId> = self
            .entity_memberships
            .get(&entity_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();

        for ctx_id in ctx_ids {
            if let Some(ctx) = self.contexts.get_mut(&ctx_id) {
                if now_active {
                    if ctx.deactivated_entities.remove(&entity_id).is_some() {
                        ctx.entities.insert(entity_id, ());
                    }
                } else if ctx.entities.remove(&entity_id).is_some() {
                    ctx.deactivated_entities.insert(entity_id, ());
                }
            }
            if let Some(m) = self.entity_memberships.get_mut(&entity_id) {
                m.insert(ctx_id, now_active);
            }
        }
    }

    /// The set of contexts this entity is currently an *active* member of.
    fn active_contexts_of(&self, entity_id: EntityId) -> Vec<ContextId> {
        self.entity_memberships
            .get(&entity_id)
            .map(|m| m.iter().filter(|(_, active)| **active).map(|(cid, _)| *cid).collect())
            .unwrap_or_default()
    }

    fn fire_component_event(&mut self, entity_id: EntityId, comp_id: CompId, kind: NotificationKind) {
        self.fire_component_event_inner(entity_id, comp_id, kind, false)
    }

    fn fire_component_event_inner(&mut self, entity_id: EntityId, comp_id: CompId, kind: NotificationKind, will_destroy: bool) {
        // Capture both the contexts the entity was an active member of before
        // this mutation and the ones it is a member of after: a removal that
        // drops membership still needs to reach the context it is leaving
        // (the component existed mid-frame), and an add that grants
        // membership needs to reach the context it is joining.
        let mut ctx_ids = self.active_contexts_of(entity_id);
        self.recompute_membership_for(entity_id, comp_id);
        for ctx_id in self.active_contexts_of(entity_id) {
            if !ctx_ids.contains(&ctx_id) {
                ctx_ids.push(ctx_id);
            }
        }
        for ctx_id in ctx_ids {
            if let Some(ctx) = self.contexts.get_mut(&ctx_id) {
                match kind {
                    NotificationKind::Added => ctx.on_component_added_for_entity_in_context.emit((entity_id, comp_id)),
                    NotificationKind::Removed => ctx.on_component_removed_for_entity_in_context.emit((entity_id, comp_id, will_destroy)),
                    NotificationKind::Modified => ctx.on_component_modified_for_entity_in_context.emit((entity_id, comp_id)),
                    NotificationKind::Enabled | NotificationKind::Disabled => {}
                }
            }

            let watcher_id = component_watcher_id(ctx_id, comp_id);
            if let Some(watcher) = self.component_watchers.get_mut(&watcher_id) {
                let became_pending = match kind {
                    NotificationKind::Added => watcher.on_added(entity_id),
                    NotificationKind::Removed => watcher.on_removed(entity_id),
                    NotificationKind::Modified => watcher.on_modified(entity_id),
                    NotificationKind::Enabled => watcher.on_enabled(entity_id),
                    NotificationKind::Disabled => watcher.on_disabled(entity_id),
                };
                if became_pending {
                    self.queue_watcher_notification(watcher_id);
                }
            }
        }
    }

    /// Synchronous `before_*` dispatch (§4.4: "emits a synchronous before_*
    /// callback on the world, not queued"). Runs the matching system hook
    /// immediately, bypassing the coalescing buffer entirely.
    fn fire_before(&mut self, entity_id: EntityId, comp_id: CompId, before_removing: bool) {
        for ctx_id in self.active_contexts_of(entity_id) {
            if let Some(ctx) = self.contexts.get_mut(&ctx_id) {
                if before_removing {
                    ctx.on_component_before_removing_for_entity_in_context.emit((entity_id, comp_id, false));
                } else {
                    ctx.on_component_before_modifying_for_entity_in_context.emit((entity_id, comp_id));
                }
            }

            let watcher_id = component_watcher_id(ctx_id, comp_id);
            let subscribers = match self.watcher_subscribers.get(&watcher_id) {
                Some(s) => s.clone(),
                None => continue,
            };
            for sid in subscribers {
                self.dispatch_one_reactive(sid, ctx_id, comp_id, &[entity_id], before_removing, true);
            }
        }
    }

    fn fire_entity_activation(&mut self, entity_id: EntityId, activated: bool) {
        for ctx_id in self.active_contexts_of_any(entity_id) {
            if let Some(ctx) = self.contexts.get_mut(&ctx_id) {
                if activated {
                    ctx.on_activate_entity_in_context.emit(entity_id);
                } else {
                    ctx.on_deactivate_entity_in_context.emit(entity_id);
                }
            }

            if let Some(watcher_ids) = self.context_component_watchers.get(&ctx_id).cloned() {
                for watcher_id in watcher_ids {
                    if let Some(watcher) = self.component_watchers.get_mut(&watcher_id) {
                        let became_pending = if activated {
                            watcher.on_enabled(entity_id)
                        } else {
                            watcher.on_disabled(entity_id)
                        };
                        if became_pending {
                            self.queue_watcher_notification(watcher_id);
                        }
                    }
                }
            }

            if let Some(listeners) = self.context_activation_listeners.get(&ctx_id).cloned() {
                for sid in listeners {
                    self.dispatch_activation_listener(sid, ctx_id, entity_id, activated);
                }
            }
        }
    }

    /// Like `active_contexts_of`, but used right at the activate/deactivate
    /// transition point, where `entity_memberships` still reflects the
    /// *post*-transition active flag (set by `move_entity_active_buckets`
    /// before this is called) — so this just reuses the same table.
    fn active_contexts_of_any(&self, entity_id: EntityId) -> Vec<ContextId> {
        self.entity_memberships
            .get(&entity_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    fn dispatch_activation_listener(&mut self, sid: SystemId, ctx_id: ContextId, entity_id: EntityId, activated: bool) {
        let idx = sid.index() as usize;
        if idx >= self.systems.len() {
            return;
        }
        let mut system = std::mem::replace(&mut self.systems[idx].system, Box::new(NoopSystem));
        {
            let mut scope = Scope::new(self, ctx_id);
            if activated {
                system.on_activated(&mut scope, entity_id);
            } else {
                system.on_deactivated(&mut scope, entity_id);
            }
        }
        self.systems[idx].system = system;
    }

    fn dispatch_one_reactive(&mut self, sid: SystemId, ctx_id: ContextId, comp_id: CompId, entities: &[EntityId], kind_is_removing_before: bool, is_before: bool) {
        let idx = sid.index() as usize;
        if idx >= self.systems.len() {
            return;
        }
        let mut system = std::mem::replace(&mut self.systems[idx].system, Box::new(NoopSystem));
        {
            let mut scope = Scope::new(self, ctx_id);
            let batch = ReactiveBatch { comp_id, entities };
            if is_before {
                if kind_is_removing_before {
                    system.on_before_removing(&mut scope, batch);
                } else {
                    system.on_before_modifying(&mut scope, batch);
                }
            }
        }
        self.systems[idx].system = system;
    }

    fn dispatch_reactive_kind(&mut self, sid: SystemId, ctx_id: ContextId, comp_id: CompId, kind: NotificationKind, entities: &[EntityId]) {
        let idx = sid.index() as usize;
        if idx >= self.systems.len() {
            return;
        }
        let mut system = std::mem::replace(&mut self.systems[idx].system, Box::new(NoopSystem));
        {
            let mut scope = Scope::new(self, ctx_id);
            let batch = ReactiveBatch { comp_id, entities };
            match kind {
                NotificationKind::Added => system.on_added(&mut scope, batch),
                NotificationKind::Removed => system.on_removed(&mut scope, batch),
                NotificationKind::Modified => system.on_modified(&mut scope, batch),
                NotificationKind::Enabled => system.on_enabled(&mut scope, batch),
                NotificationKind::Disabled => system.on_disabled(&mut scope, batch),
            }
        }
        self.systems[idx].system = system;
    }

    /// Drains `watchers_triggered` to a fixpoint (§4.6, §9 "reactive
    /// cascade"): each pass snapshots the pending watcher ids, pops their
    /// buffers, and dispatches in system-registration order with kinds in
    /// `NotificationKind::DISPATCH_ORDER` within each system. If dispatch
    /// produces new pending notifications the whole drain repeats.
    fn drain_reactive_queue(&mut self) {
        loop {
            if self.watchers_triggered.is_empty() {
                break;
            }
            let pending: Vec<WatcherId> = std::mem::take(&mut self.watchers_triggered);
            self.watchers_triggered_set.clear();

            // system_id -> entries of (comp_id, kind, entities), collected in
            // whatever order the watchers happen to be visited, then
            // re-sorted into NotificationKind::DISPATCH_ORDER per system.
            let mut per_system: FxHashMap<SystemId, Vec<(ContextId, CompId, NotificationKind, Vec<EntityId>)>> = FxHashMap::default();

            for watcher_id in pending {
                let entities_ref = &self.entities;
                let popped = match self.component_watchers.get_mut(&watcher_id) {
                    Some(watcher) => {
                        let comp_id = watcher.comp_id;
                        let ctx_id = watcher.context_id;
                        let notifications = watcher.pop_notifications(|id| entities_ref.get(&id).map(|e| e.destroyed).unwrap_or(true));
                        Some((ctx_id, comp_id, notifications))
                    }
                    None => None,
                };
                let (ctx_id, comp_id, notifications) = match popped {
                    Some(v) => v,
                    None => continue,
                };

                let subscribers = self.watcher_subscribers.get(&watcher_id).cloned().unwrap_or_default();
                for (kind, entities) in notifications {
                    if entities.is_empty() {
                        continue;
                    }
                    for sid in &subscribers {
                        per_system
                            .entry(*sid)
                            .or_default()
                            .push((ctx_id, comp_id, kind, entities.clone()));
                    }
                }
            }

            let system_order: Vec<SystemId> = per_system.keys().copied().sorted_by_key(|s| s.index()).collect();
            for sid in system_order {
                let mut entries = per_system.remove(&sid).unwrap_or_default();
                entries.sort_by_key(|(_, _, kind, _)| NotificationKind::DISPATCH_ORDER.iter().position(|k| k == kind).unwrap());
                for (ctx_id, comp_id, kind, entities) in entries {
                    self.dispatch_reactive_kind(sid, ctx_id, comp_id, kind, &entities);
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Pending destroy / message clearing (§4.6 end-of-phase steps)
    // ---------------------------------------------------------------

    fn destroy_pending_entities(&mut self) {
        let pending: SmallVec<[EntityId; 8]> = std::mem::take(&mut self.pending_destroy);
        for id in pending {
            self.dispose_entity(id);
        }
    }

    fn dispose_entity(&mut self, id: EntityId) {
        let Some(record) = self.entities.get(&id) else { return };
        if !record.destroyed {
            // dispose() may be invoked directly (e.g. by `World::dispose`)
            // on an entity that was never formally destroyed first.
            self.destroy_entity(id);
        }

        // Unparent.
        if let Some(parent_id) = self.entities.get(&id).and_then(|e| e.parent) {
            self.detach_from_parent(id, parent_id);
        }
        let child_ids: Vec<EntityId> = self.entities.get(&id).map(|e| e.children.keys().copied().collect()).unwrap_or_default();
        for child in child_ids {
            if let Some(child_record) = self.entities.get_mut(&child) {
                child_record.parent = None;
            }
        }

        // Drop membership from every context.
        let ctx_ids: Vec<ContextId> = self.entity_memberships.remove(&id).map(|m| m.into_keys().collect()).unwrap_or_default();
        for ctx_id in ctx_ids {
            if let Some(ctx) = self.contexts.get_mut(&ctx_id) {
                ctx.entities.remove(&id);
                ctx.deactivated_entities.remove(&id);
            }
        }

        self.entities.remove(&id);
        self.messaged_entities.remove(&id);
        trace!(entity = %id, "entity disposed");
    }

    fn apply_pending_activations(&mut self) {
        for sid in self.pending_activate.drain(..).collect::<Vec<_>>() {
            if let Some(entry) = self.systems.get_mut(sid.index() as usize) {
                entry.active = true;
            }
        }
        for sid in self.pending_deactivate.drain(..).collect::<Vec<_>>() {
            if let Some(entry) = self.systems.get_mut(sid.index() as usize) {
                entry.active = false;
            }
        }
    }

    fn clear_frame_messages(&mut self) {
        for id in self.messaged_entities.drain().collect::<Vec<_>>() {
            let comp_ids: Vec<CompId> = match self.entities.get_mut(&id) {
                Some(record) => {
                    let ids = record.messages.keys().copied().collect();
                    record.messages.clear();
                    ids
                }
                None => continue,
            };
            for comp_id in comp_ids {
                self.recompute_membership_for(id, comp_id);
            }
        }
    }

    /// Runs after every phase body: drain reactive notifications to a
    /// fixpoint, destroy pending entities, apply pending (de)activations,
    /// and — only for `update` — clear this frame's messages (§4.6).
    fn end_of_phase(&mut self, clear_messages: bool) {
        self.drain_reactive_queue();
        self.destroy_pending_entities();
        self.apply_pending_activations();
        if clear_messages {
            self.clear_frame_messages();
        }
    }

    // ---------------------------------------------------------------
    // Phase dispatch (§4.6, §5 "ordering guarantees")
    // ---------------------------------------------------------------

    fn run_phase(&mut self, cap: Capability, mut call: impl FnMut(&mut dyn System, &mut Scope<'_>)) {
        if self.is_exiting {
            return;
        }
        let system_ids = self.phase_lists.get(&cap).cloned().unwrap_or_default();
        for sid in system_ids {
            let idx = sid.index() as usize;
            let (active, ctx_id) = match self.systems.get(idx) {
                Some(entry) => (entry.active, entry.context_id),
                None => continue,
            };
            if !active && !(self.is_paused && cap.always_runs_while_paused()) {
                continue;
            }
            let ctx_id = match ctx_id {
                Some(c) => c,
                None => continue,
            };

            // Take the system out of its slot so `Scope` can hold an
            // exclusive `&mut World` without aliasing the very table the
            // system lives in (see `Scope`, `system::NoopSystem`).
            let mut system = std::mem::replace(&mut self.systems[idx].system, Box::new(NoopSystem));
            {
                let mut scope = Scope::new(self, ctx_id);
                call(&mut *system, &mut scope);
            }
            self.systems[idx].system = system;
        }
    }

    pub fn early_start(&mut self) {
        self.run_phase(Capability::EarlyStartup, |s, scope| s.early_start(scope));
        self.end_of_phase(false);
    }

    pub fn start(&mut self) {
        self.run_phase(Capability::Startup, |s, scope| s.start(scope));
        self.end_of_phase(false);
    }

    pub fn update(&mut self) {
        self.run_phase(Capability::Update, |s, scope| s.update(scope));
        self.end_of_phase(true);
    }

    pub fn late_update(&mut self) {
        self.run_phase(Capability::LateUpdate, |s, scope| s.late_update(scope));
        self.end_of_phase(false);
    }

    pub fn fixed_update(&mut self) {
        self.run_phase(Capability::FixedUpdate, |s, scope| s.fixed_update(scope));
        self.end_of_phase(false);
    }

    pub fn render(&mut self) {
        self.run_phase(Capability::Render, |s, scope| s.render(scope));
        self.end_of_phase(false);
    }

    /// One-shot shutdown (§5): runs every `Exit` system, disposes every
    /// entity (including deactivated ones) and every context, then marks
    /// the world exiting so further phase calls are no-ops.
    pub fn exit(&mut self) {
        if self.is_exiting {
            return;
        }
        self.run_phase(Capability::Exit, |s, scope| s.exit(scope));
        self.dispose();
        self.is_exiting = true;
    }

    pub fn is_exiting(&self) -> bool {
        self.is_exiting
    }

    /// Disposes every entity (active or deactivated) and every context.
    /// Called by [`World::exit`]; also exposed directly for a host that
    /// wants to tear the world down without running exit systems (§6
    /// `dispose`).
    pub fn dispose(&mut self) {
        let ids: Vec<EntityId> = self.entities.keys().copied().collect();
        for id in ids {
            self.dispose_entity(id);
        }
        self.contexts.clear();
        self.component_watchers.clear();
        self.message_watchers.clear();
    }

    // ---------------------------------------------------------------
    // Messages (§4.5, in-frame delivery)
    // ---------------------------------------------------------------

    pub(crate) fn send_message(&mut self, entity_id: EntityId, comp_id: CompId, message: Box<dyn Message>) {
        let Some(record) = self.entities.get_mut(&entity_id) else { return };
        if record.destroyed {
            trace!(entity = %entity_id, "send_message on a destroyed entity, silently ignored (UseAfterDestroy)");
            return;
        }
        record.messages.insert(comp_id, message);
        record.on_message.emit((entity_id, comp_id));
        self.messaged_entities.insert(entity_id);

        let mut ctx_ids = self.active_contexts_of(entity_id);
        self.recompute_membership_for(entity_id, comp_id);
        for ctx_id in self.active_contexts_of(entity_id) {
            if !ctx_ids.contains(&ctx_id) {
                ctx_ids.push(ctx_id);
            }
        }

        // Taken out of the entity's map for the duration of dispatch so a
        // subscriber can be handed both an owned reference to it and a
        // `&mut World` (through `Scope`) without the two aliasing; put back
        // once every subscriber has seen it, since it lives until the
        // owning entity's messages are cleared at end of frame.
        let message_box = self.entities.get_mut(&entity_id).and_then(|e| e.messages.remove(&comp_id));
        let Some(message_box) = message_box else { return };

        for ctx_id in ctx_ids {
            if let Some(ctx) = self.contexts.get_mut(&ctx_id) {
                ctx.on_message_sent_for_entity_in_context.emit((entity_id, comp_id));
            }
            if let Some(watcher_ids) = self.context_message_watchers.get(&ctx_id).cloned() {
                for watcher_id in watcher_ids {
                    let targets = self.message_watchers.get(&watcher_id).map(|w| w.targets(comp_id)).unwrap_or(false);
                    if !targets {
                        continue;
                    }
                    let subscribers = self.message_watcher_subscribers.get(&watcher_id).cloned().unwrap_or_default();
                    for sid in subscribers {
                        let idx = sid.index() as usize;
                        if idx >= self.systems.len() {
                            continue;
                        }
                        let mut system = std::mem::replace(&mut self.systems[idx].system, Box::new(NoopSystem));
                        {
                            let mut scope = Scope::new(self, ctx_id);
                            system.on_message(&mut scope, entity_id, message_box.as_ref());
                        }
                        self.systems[idx].system = system;
                    }
                }
            }
        }

        if let Some(record) = self.entities.get_mut(&entity_id) {
            record.messages.insert(comp_id, message_box);
        }
    }

    // ---------------------------------------------------------------
    // Entity mutation internals shared by `EntityMut`
    // ---------------------------------------------------------------

    fn add_component_dyn(&mut self, entity_id: EntityId, comp_id: CompId, component: Box<dyn Component>) {
        let Some(record) = self.entities.get_mut(&entity_id) else { return };
        if record.destroyed {
            trace!(entity = %entity_id, ?comp_id, "add on a destroyed entity, silently ignored (UseAfterDestroy)");
            return;
        }
        if record.components.contains_key(&comp_id) {
            warn!(entity = %entity_id, ?comp_id, "DuplicateAdd: component already present, use replace/add_or_replace instead");
            return;
        }
        record.components.insert(comp_id, component);
        record.on_component_added.emit((entity_id, comp_id));
        self.check_requires(self.entities.get(&entity_id).unwrap(), comp_id);

        self.fire_component_event(entity_id, comp_id, NotificationKind::Added);
    }

    fn replace_component_dyn(&mut self, entity_id: EntityId, comp_id: CompId, component: Box<dyn Component>) {
        let Some(record) = self.entities.get_mut(&entity_id) else { return };
        if record.destroyed {
            trace!(entity = %entity_id, ?comp_id, "replace on a destroyed entity, silently ignored (UseAfterDestroy)");
            return;
        }
        if !record.components.contains_key(&comp_id) {
            warn!(entity = %entity_id, ?comp_id, "ReplaceAbsent: no existing component to replace, use add instead");
            return;
        }

        record.on_component_before_modifying.emit((entity_id, comp_id));
        self.fire_before(entity_id, comp_id, false);

        let record = self.entities.get_mut(&entity_id).unwrap();
        record.components.insert(comp_id, component);
        record.on_component_modified.emit((entity_id, comp_id));

        self.fire_component_event(entity_id, comp_id, NotificationKind::Modified);
    }

    fn remove_component_dyn(&mut self, entity_id: EntityId, comp_id: CompId) {
        let Some(record) = self.entities.get(&entity_id) else { return };
        if record.destroyed || !record.components.contains_key(&comp_id) {
            return;
        }
        let will_destroy = record.components.len() == 1;

        let record_mut = self.entities.get_mut(&entity_id).unwrap();
        record_mut.on_component_before_removing.emit((entity_id, comp_id, will_destroy));
        self.fire_before(entity_id, comp_id, true);

        let record_mut = self.entities.get_mut(&entity_id).unwrap();
        record_mut.components.remove(&comp_id);
        record_mut.on_component_removed.emit((entity_id, comp_id, will_destroy));

        self.fire_component_event_inner(entity_id, comp_id, NotificationKind::Removed, will_destroy);

        if will_destroy {
            self.destroy_entity(entity_id);
        }
    }

    fn destroy_entity(&mut self, entity_id: EntityId) {
        let Some(record) = self.entities.get(&entity_id) else { return };
        if record.destroyed {
            return;
        }
        let comp_ids: Vec<CompId> = record.components.keys().copied().collect();

        for comp_id in comp_ids {
            let record_mut = self.entities.get_mut(&entity_id).unwrap();
            record_mut.on_component_before_removing.emit((entity_id, comp_id, true));
            self.fire_before(entity_id, comp_id, true);

            let record_mut = self.entities.get_mut(&entity_id).unwrap();
            record_mut.components.remove(&comp_id);
            record_mut.on_component_removed.emit((entity_id, comp_id, true));
            self.fire_component_event_inner(entity_id, comp_id, NotificationKind::Removed, true);
        }

        let record_mut = self.entities.get_mut(&entity_id).unwrap();
        record_mut.destroyed = true;
        record_mut.on_entity_destroyed.emit(entity_id);

        // Cascade to children: a destroyed parent destroys its children too.
        let child_ids: Vec<EntityId> = record_mut.children.keys().copied().collect();
        for child in child_ids {
            self.destroy_entity(child);
        }

        if !self.pending_destroy.contains(&entity_id) {
            self.pending_destroy.push(entity_id);
        }
    }

    fn activate_entity(&mut self, entity_id: EntityId) {
        let Some(record) = self.entities.get_mut(&entity_id) else { return };
        if record.destroyed || !record.deactivated {
            return;
        }
        record.deactivated = false;
        record.deactivated_from_parent = false;
        record.on_entity_activated.emit(entity_id);

        self.move_entity_active_buckets(entity_id, true);
        self.fire_entity_activation(entity_id, true);

        // Reactivate exactly the descendants this entity's deactivation
        // caused to deactivate (§3, §8 S4).
        let children: Vec<EntityId> = self.entities.get(&entity_id).map(|e| e.children.keys().copied().collect()).unwrap_or_default();
        for child in children {
            let should_reactivate = self
                .entities
                .get(&child)
                .map(|c| c.deactivated && c.deactivated_from_parent)
                .unwrap_or(false);
            if should_reactivate {
                self.activate_entity(child);
            }
        }
    }

    fn deactivate_entity_inner(&mut self, entity_id: EntityId, from_parent: bool) {
        let Some(record) = self.entities.get_mut(&entity_id) else { return };
        if record.destroyed || record.deactivated {
            return;
        }
        record.deactivated = true;
        record.deactivated_from_parent = from_parent;
        record.on_entity_deactivated.emit(entity_id);

        self.move_entity_active_buckets(entity_id, false);
        self.fire_entity_activation(entity_id, false);

        let children: Vec<EntityId> = self.entities.get(&entity_id).map(|e| e.children.keys().copied().collect()).unwrap_or_default();
        for child in children {
            self.deactivate_entity_inner(child, true);
        }
    }

    fn reparent_entity(&mut self, entity_id: EntityId, new_parent: Option<EntityId>) {
        let old_parent = self.entities.get(&entity_id).and_then(|e| e.parent);
        if let Some(old) = old_parent {
            self.detach_from_parent(entity_id, old);
        }

        let Some(new_parent_id) = new_parent else {
            return;
        };

        let parent_destroyed = self.entities.get(&new_parent_id).map(|p| p.destroyed).unwrap_or(true);
        if parent_destroyed {
            warn!(entity = %entity_id, parent = %new_parent_id, "reparent target is already destroyed, destroying child too");
            self.destroy_entity(entity_id);
            return;
        }

        if let Some(record) = self.entities.get_mut(&entity_id) {
            record.parent = Some(new_parent_id);
        }
        if let Some(parent) = self.entities.get_mut(&new_parent_id) {
            parent.children.insert(entity_id, None);
        }

        let parent_deactivated = self.entities.get(&new_parent_id).map(|p| p.deactivated).unwrap_or(false);
        if parent_deactivated {
            self.deactivate_entity_inner(entity_id, true);
        }
    }

    fn detach_from_parent(&mut self, entity_id: EntityId, parent_id: EntityId) {
        if let Some(parent) = self.entities.get_mut(&parent_id) {
            if let Some(name) = parent.children.remove(&entity_id).flatten() {
                parent.children_by_name.remove(&name);
            }
        }
        if let Some(record) = self.entities.get_mut(&entity_id) {
            record.parent = None;
        }
    }

    fn add_child_inner(&mut self, parent_id: EntityId, child_id: EntityId, name: Option<String>) {
        if let Some(old_parent) = self.entities.get(&child_id).and_then(|c| c.parent) {
            self.detach_from_parent(child_id, old_parent);
        }
        if let Some(record) = self.entities.get_mut(&child_id) {
            record.parent = Some(parent_id);
        }
        if let Some(parent) = self.entities.get_mut(&parent_id) {
            parent.children.insert(child_id, name.clone());
            if let Some(name) = name {
                parent.children_by_name.insert(name, child_id);
            }
        }

        let parent_destroyed = self.entities.get(&parent_id).map(|p| p.destroyed).unwrap_or(true);
        if parent_destroyed {
            self.destroy_entity(child_id);
            return;
        }
        let parent_deactivated = self.entities.get(&parent_id).map(|p| p.deactivated).unwrap_or(false);
        if parent_deactivated {
            self.deactivate_entity_inner(child_id, true);
        }
    }

    fn remove_child_by_id_inner(&mut self, parent_id: EntityId, child_id: EntityId) {
        self.detach_from_parent(child_id, parent_id);
    }

    fn remove_child_by_name_inner(&mut self, parent_id: EntityId, name: &str) {
        let child_id = self.entities.get(&parent_id).and_then(|p| p.children_by_name.get(name).copied());
        if let Some(child_id) = child_id {
            self.detach_from_parent(child_id, parent_id);
        }
    }

    fn dispose_all_components(&mut self, entity_id: EntityId) {
        if !self.entities.get(&entity_id).map(|e| e.destroyed).unwrap_or(true) {
            self.destroy_entity(entity_id);
        }
    }

    /// Wholesale `replace` with `wipe = true` (§4.2, §9 open question):
    /// removes every present component not marked `keep_on_replace`, each
    /// through the normal `remove` path so before/after notifications and
    /// the "last component destroys the entity" rule apply unchanged.
    ///
    /// The original engine ties this to entity-id pooling and performs a
    /// two-pass reconciliation of `self._children` whose exact intent is
    /// ambiguous (§9). Since this engine never recycles an `EntityId` within
    /// a session, there is no analogous "new identity" for children to be
    /// re-registered under — `wipe_entity` leaves the parent/child hierarchy
    /// untouched and only clears non-kept components.
    fn wipe_entity(&mut self, entity_id: EntityId) {
        let Some(record) = self.entities.get(&entity_id) else { return };
        if record.destroyed {
            return;
        }
        let comp_ids: Vec<CompId> = record
            .components
            .keys()
            .copied()
            .filter(|c| !self.keep_on_replace.contains(c))
            .collect();
        for comp_id in comp_ids {
            self.remove_component_dyn(entity_id, comp_id);
        }
    }

    // ---------------------------------------------------------------
    // Pause policy (§4.6 "Pause policy")
    // ---------------------------------------------------------------

    /// A system is pausable iff it is an Update/LateUpdate/FixedUpdate
    /// system, is not a Render system, and is not marked `do_not_pause` —
    /// except that `include_on_pause` forces inclusion regardless (§9
    /// precedence: `include_on_pause -> render excluded -> do_not_pause ->
    /// update-kind check`).
    fn is_pausable(meta: &SystemMeta) -> bool {
        if meta.include_on_pause {
            return true;
        }
        if meta.capabilities.contains(Capability::Render) {
            return false;
        }
        if meta.do_not_pause {
            return false;
        }
        meta.capabilities.contains(Capability::Update)
            || meta.capabilities.contains(Capability::LateUpdate)
            || meta.capabilities.contains(Capability::FixedUpdate)
    }

    pub fn pause(&mut self) {
        if self.is_paused {
            return;
        }
        self.is_paused = true;
        self.paused_systems_remembered.clear();

        for (idx, entry) in self.systems.iter_mut().enumerate() {
            if entry.active && Self::is_pausable(&entry.meta) {
                entry.active = false;
                self.paused_systems_remembered.push(SystemId(idx as u32));
            }
        }
        for entry in self.systems.iter_mut() {
            if entry.meta.on_pause {
                entry.active = true;
            }
        }
    }

    pub fn resume(&mut self) {
        if !self.is_paused {
            return;
        }
        self.is_paused = false;

        for sid in self.paused_systems_remembered.drain(..) {
            if let Some(entry) = self.systems.get_mut(sid.index() as usize) {
                entry.active = true;
            }
        }
        for entry in self.systems.iter_mut() {
            if entry.meta.on_pause {
                entry.active = false;
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    /// Immediate or end-of-phase system (de)activation (§6). Returns
    /// `false` (`SystemMissing`, §7) if `name` was never registered.
    pub fn activate_system(&mut self, name: &str, immediate: bool) -> bool {
        let Some(sid) = self.system_id_of(name) else { return false };
        if immediate {
            if let Some(entry) = self.systems.get_mut(sid.index() as usize) {
                entry.active = true;
            }
        } else {
            self.pending_activate.push(sid);
        }
        true
    }

    pub fn deactivate_system(&mut self, name: &str, immediate: bool) -> bool {
        let Some(sid) = self.system_id_of(name) else { return false };
        if immediate {
            if let Some(entry) = self.systems.get_mut(sid.index() as usize) {
                entry.active = false;
            }
        } else {
            self.pending_deactivate.push(sid);
        }
        true
    }

    pub fn activate_all_systems(&mut self) {
        for entry in self.systems.iter_mut() {
            entry.active = true;
        }
    }

    pub fn deactivate_all_systems(&mut self, skip: &[&str]) {
        for entry in self.systems.iter_mut() {
            if !skip.contains(&entry.meta.name) {
                entry.active = false;
            }
        }
    }
}

/// Ergonomic, `entity.add(...)`-style handle into one entity's storage,
/// borrowed from the `World` (§4.2's "Entity" operations, realized as
/// `World` methods keyed by `EntityId` per the redesign note on cyclic
/// references — see `entity.rs`).
pub struct EntityMut<'w> {
    world: &'w mut World,
    id: EntityId,
}

impl<'w> EntityMut<'w> {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn has<T: Component + 'static>(&self) -> bool {
        match self.world.index.try_id_of::<T>() {
            Some(comp_id) => self.world.get_entity(self.id).has(comp_id),
            None => false,
        }
    }

    pub fn has_message<T: Message + 'static>(&self) -> bool {
        match self.world.index.try_id_of_message::<T>() {
            Some(comp_id) => self.world.get_entity(self.id).has(comp_id),
            None => false,
        }
    }

    pub fn try_get<T: Component + 'static>(&self) -> Option<&T> {
        let comp_id = self.world.index.try_id_of::<T>()?;
        self.world.get_entity(self.id).components.get(&comp_id).and_then(|c| c.as_any().downcast_ref::<T>())
    }

    /// Fatal (programmer error) if `T` is absent (§4.2, §7 `MissingComponent`).
    pub fn get<T: Component + 'static>(&mut self) -> Result<&T, EcsError> {
        let comp_id = self.world.component_id::<T>();
        self.world
            .get_entity(self.id)
            .components
            .get(&comp_id)
            .and_then(|c| c.as_any().downcast_ref::<T>())
            .ok_or(EcsError::MissingComponent {
                entity: self.id,
                comp_id,
                type_name: std::any::type_name::<T>(),
            })
    }

    pub fn add<T: Component + 'static>(&mut self, component: T) -> &mut Self {
        let comp_id = self.world.component_id::<T>();
        self.world.add_component_dyn(self.id, comp_id, Box::new(component));
        self
    }

    /// `force = false` may short-circuit when the new value structurally
    /// equals the old one (§4.2); since components are stored as
    /// `Box<dyn Component>` without a blanket `PartialEq`, this engine
    /// always treats a `replace` as a real modification — callers that want
    /// the short-circuit should compare before calling `replace`.
    pub fn replace<T: Component + 'static>(&mut self, component: T) -> &mut Self {
        let comp_id = self.world.component_id::<T>();
        self.world.replace_component_dyn(self.id, comp_id, Box::new(component));
        self
    }

    pub fn add_or_replace<T: Component + 'static>(&mut self, component: T) -> &mut Self {
        if self.has::<T>() {
            self.replace(component)
        } else {
            self.add(component)
        }
    }

    pub fn remove<T: Component + 'static>(&mut self) -> &mut Self {
        if let Some(comp_id) = self.world.index.try_id_of::<T>() {
            self.world.remove_component_dyn(self.id, comp_id);
        }
        self
    }

    pub fn remove_by_id(&mut self, comp_id: CompId) -> &mut Self {
        self.world.remove_component_dyn(self.id, comp_id);
        self
    }

    pub fn destroy(&mut self) {
        self.world.destroy_entity(self.id);
        if !self.world.pending_destroy.contains(&self.id) {
            self.world.pending_destroy.push(self.id);
        }
    }

    pub fn activate(&mut self) -> &mut Self {
        self.world.activate_entity(self.id);
        self
    }

    pub fn deactivate(&mut self) -> &mut Self {
        self.world.deactivate_entity_inner(self.id, false);
        self
    }

    pub fn reparent(&mut self, new_parent: Option<EntityId>) -> &mut Self {
        self.world.reparent_entity(self.id, new_parent);
        self
    }

    pub fn add_child(&mut self, child: EntityId, name: Option<String>) -> &mut Self {
        self.world.add_child_inner(self.id, child, name);
        self
    }

    pub fn remove_child(&mut self, child: EntityId) -> &mut Self {
        self.world.remove_child_by_id_inner(self.id, child);
        self
    }

    pub fn remove_child_by_name(&mut self, name: &str) -> &mut Self {
        self.world.remove_child_by_name_inner(self.id, name);
        self
    }

    pub fn has_child(&self, child: EntityId) -> bool {
        self.world.get_entity(self.id).has_child(child)
    }

    pub fn child_by_name(&self, name: &str) -> Option<EntityId> {
        self.world.get_entity(self.id).child_by_name(name)
    }

    pub fn parent(&self) -> Option<EntityId> {
        self.world.get_entity(self.id).parent()
    }

    pub fn children(&self) -> Vec<(EntityId, Option<String>)> {
        self.world
            .get_entity(self.id)
            .children()
            .map(|(id, name)| (id, name.map(str::to_owned)))
            .collect()
    }

    pub fn send_message<M: Message + 'static>(&mut self, message: M) -> &mut Self {
        let comp_id = self.world.message_id::<M>();
        self.world.send_message(self.id, comp_id, Box::new(message));
        self
    }

    pub fn dispose(&mut self) {
        self.world.dispose_all_components(self.id);
    }

    /// Wholesale `replace` with `wipe = true` (§4.2): clears every present
    /// component not marked `keep_on_replace` via `World::mark_keep_on_replace`.
    /// See `World::wipe_entity` for the open-question resolution this
    /// implements.
    pub fn wipe(&mut self) -> &mut Self {
        self.world.wipe_entity(self.id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FilterAccess, FilterDecl};
    use crate::system::{Capability, CapabilitySet, ReactiveBatch, System};

    #[derive(Debug)]
    struct Marker;
    impl Component for Marker {}

    #[derive(Debug)]
    struct Other;
    impl Component for Other {}

    struct NoopUpdateSystem;
    impl System for NoopUpdateSystem {}

    fn all_of(comp_ids: &[CompId]) -> Vec<FilterDecl> {
        vec![FilterDecl {
            kind: FilterKind::AllOf,
            access: FilterAccess::ReadWrite,
            comp_ids: comp_ids.to_vec(),
        }]
    }

    #[test]
    fn adding_and_removing_only_component_destroys_entity() {
        let mut world = World::new(WorldConfig::default(), ComponentIndex::new(), Vec::new()).unwrap();
        let e = world.add_entity();
        world.entity_mut(e).unwrap().add(Marker);
        assert!(!world.get_entity(e).destroyed);

        world.entity_mut(e).unwrap().remove::<Marker>();
        assert!(world.get_entity(e).destroyed);
    }

    #[test]
    fn add_then_remove_returns_entity_to_prior_state() {
        let mut world = World::new(WorldConfig::default(), ComponentIndex::new(), Vec::new()).unwrap();
        let e = world.add_entity();
        world.entity_mut(e).unwrap().add(Other);
        assert!(!world.get_entity(e).destroyed);

        let comp_id = world.component_id::<Marker>();
        world.entity_mut(e).unwrap().add(Marker);
        world.entity_mut(e).unwrap().remove_by_id(comp_id);

        assert!(!world.get_entity(e).destroyed);
        assert!(world.entity_mut(e).unwrap().has::<Other>());
        assert!(!world.entity_mut(e).unwrap().has::<Marker>());
    }

    #[test]
    fn reparent_then_unparent_restores_no_parent_and_clears_children() {
        let mut world = World::new(WorldConfig::default(), ComponentIndex::new(), Vec::new()).unwrap();
        let parent = world.add_entity();
        let child = world.add_entity();
        world.entity_mut(parent).unwrap().add(Marker);
        world.entity_mut(child).unwrap().add(Marker);

        world.entity_mut(child).unwrap().reparent(Some(parent));
        assert_eq!(world.entity_mut(child).unwrap().parent(), Some(parent));
        assert!(world.entity_mut(parent).unwrap().has_child(child));

        world.entity_mut(child).unwrap().reparent(None);
        assert_eq!(world.entity_mut(child).unwrap().parent(), None);
        assert!(!world.entity_mut(parent).unwrap().has_child(child));
    }

    #[test]
    fn deactivate_then_activate_restores_context_membership() {
        let mut world = World::new(WorldConfig::default(), ComponentIndex::new(), Vec::new()).unwrap();
        let comp_id = world.component_id::<Marker>();
        let ctx_id = world.get_or_create_ad_hoc_context(FilterKind::AllOf, vec![comp_id]);

        let e = world.add_entity();
        world.entity_mut(e).unwrap().add(Marker);
        assert!(world.context_by_id(ctx_id).unwrap().is_active_member(e));

        world.entity_mut(e).unwrap().deactivate();
        assert!(!world.context_by_id(ctx_id).unwrap().is_active_member(e));
        assert!(world.context_by_id(ctx_id).unwrap().is_deactivated_member(e));

        world.entity_mut(e).unwrap().activate();
        assert!(world.context_by_id(ctx_id).unwrap().is_active_member(e));
        assert!(!world.context_by_id(ctx_id).unwrap().is_deactivated_member(e));
    }

    #[test]
    fn deactivating_parent_cascades_to_children_and_marks_deactivated_from_parent() {
        let mut world = World::new(WorldConfig::default(), ComponentIndex::new(), Vec::new()).unwrap();
        let parent = world.add_entity();
        let child_a = world.add_entity();
        let child_b = world.add_entity();
        for e in [parent, child_a, child_b] {
            world.entity_mut(e).unwrap().add(Marker);
        }
        world.entity_mut(child_a).unwrap().reparent(Some(parent));
        world.entity_mut(child_b).unwrap().reparent(Some(parent));

        world.entity_mut(parent).unwrap().deactivate();

        assert!(world.get_entity(child_a).deactivated);
        assert!(world.get_entity(child_a).deactivated_from_parent);
        assert!(world.get_entity(child_b).deactivated);
        assert!(world.get_entity(child_b).deactivated_from_parent);

        world.entity_mut(parent).unwrap().activate();
        assert!(!world.get_entity(child_a).deactivated);
        assert!(!world.get_entity(child_b).deactivated);
    }

    #[test]
    fn independently_deactivated_child_is_not_reactivated_by_parent() {
        let mut world = World::new(WorldConfig::default(), ComponentIndex::new(), Vec::new()).unwrap();
        let parent = world.add_entity();
        let child = world.add_entity();
        world.entity_mut(parent).unwrap().add(Marker);
        world.entity_mut(child).unwrap().add(Marker);
        world.entity_mut(child).unwrap().reparent(Some(parent));

        world.entity_mut(child).unwrap().deactivate();
        world.entity_mut(parent).unwrap().deactivate();
        assert!(world.get_entity(child).deactivated);
        assert!(!world.get_entity(child).deactivated_from_parent);

        world.entity_mut(parent).unwrap().activate();
        assert!(world.get_entity(child).deactivated, "independently-deactivated child stays deactivated");
    }

    #[test]
    fn reparenting_onto_a_destroyed_parent_destroys_the_child() {
        let mut world = World::new(WorldConfig::default(), ComponentIndex::new(), Vec::new()).unwrap();
        let parent = world.add_entity();
        world.entity_mut(parent).unwrap().add(Marker);
        let child = world.add_entity();
        world.entity_mut(child).unwrap().add(Marker);

        world.entity_mut(parent).unwrap().destroy();
        world.entity_mut(child).unwrap().reparent(Some(parent));

        assert!(world.get_entity(child).destroyed);
    }

    #[test]
    fn two_systems_with_reordered_identical_filters_share_one_context() {
        let mut builder = WorldBuilder::new(WorldConfig::default());
        let comp_a = builder.component_id::<Marker>();
        let comp_b = builder.component_id::<Other>();

        let mut meta1 = SystemMeta::new("s1", CapabilitySet::from_caps(&[Capability::Update]));
        meta1.filters = all_of(&[comp_a, comp_b]);
        let mut meta2 = SystemMeta::new("s2", CapabilitySet::from_caps(&[Capability::Update]));
        meta2.filters = all_of(&[comp_b, comp_a]);

        builder.add_system(meta1, NoopUpdateSystem, true);
        builder.add_system(meta2, NoopUpdateSystem, true);
        let world = builder.build().unwrap();

        assert_eq!(world.context_count(), 1);
    }

    #[test]
    fn keep_on_replace_component_survives_wipe() {
        let mut world = World::new(WorldConfig::default(), ComponentIndex::new(), Vec::new()).unwrap();
        let kept = world.component_id::<Marker>();
        world.mark_keep_on_replace(kept);

        let e = world.add_entity();
        world.entity_mut(e).unwrap().add(Marker);
        world.entity_mut(e).unwrap().add(Other);

        world.entity_mut(e).unwrap().wipe();

        assert!(world.entity_mut(e).unwrap().has::<Marker>());
        assert!(!world.entity_mut(e).unwrap().has::<Other>());
        assert!(!world.get_entity(e).destroyed);
    }

    #[test]
    fn wiping_with_no_kept_components_destroys_the_entity() {
        let mut world = World::new(WorldConfig::default(), ComponentIndex::new(), Vec::new()).unwrap();
        let e = world.add_entity();
        world.entity_mut(e).unwrap().add(Marker);
        world.entity_mut(e).unwrap().wipe();
        assert!(world.get_entity(e).destroyed);
    }

    #[test]
    fn pause_deactivates_pausable_systems_and_activates_on_pause_systems() {
        let mut builder = WorldBuilder::new(WorldConfig::default());

        let mut update_meta = SystemMeta::new("gameplay", CapabilitySet::from_caps(&[Capability::Update]));
        update_meta.filters = Vec::new();
        builder.add_system(update_meta, NoopUpdateSystem, true);

        let mut pause_menu_meta = SystemMeta::new("pause_menu", CapabilitySet::from_caps(&[Capability::Update]));
        pause_menu_meta.on_pause = true;
        builder.add_system(pause_menu_meta, NoopUpdateSystem, false);

        let mut always_meta = SystemMeta::new("physics_cleanup", CapabilitySet::from_caps(&[Capability::Update]));
        always_meta.do_not_pause = true;
        builder.add_system(always_meta, NoopUpdateSystem, true);

        let mut world = builder.build().unwrap();
        let gameplay = world.system_id_of("gameplay").unwrap();
        let pause_menu = world.system_id_of("pause_menu").unwrap();
        let physics_cleanup = world.system_id_of("physics_cleanup").unwrap();

        world.pause();
        assert!(!world.is_system_active(gameplay));
        assert!(world.is_system_active(pause_menu));
        assert!(world.is_system_active(physics_cleanup));

        world.resume();
        assert!(world.is_system_active(gameplay));
        assert!(!world.is_system_active(pause_menu));
        assert!(world.is_system_active(physics_cleanup));
    }

    #[test]
    fn bad_metadata_is_rejected_at_registration() {
        let mut builder = WorldBuilder::new(WorldConfig::default());
        let broken = SystemMeta::new("broken_reactive", CapabilitySet::from_caps(&[Capability::Reactive]));
        builder.add_system(broken, NoopUpdateSystem, true);
        assert!(matches!(builder.build(), Err(EcsError::BadMetadata { .. })));
    }

    #[test]
    fn reactive_watcher_buffer_and_queue_are_empty_after_update() {
        struct Tally(std::rc::Rc<std::cell::RefCell<u32>>);
        impl System for Tally {
            fn on_added(&mut self, _scope: &mut Scope<'_>, batch: ReactiveBatch<'_>) {
                *self.0.borrow_mut() += batch.entities.len() as u32;
            }
        }

        let mut builder = WorldBuilder::new(WorldConfig::default());
        let comp_id = builder.component_id::<Marker>();
        let tally = std::rc::Rc::new(std::cell::RefCell::new(0));

        let mut meta = SystemMeta::new("tally", CapabilitySet::from_caps(&[Capability::Reactive]));
        meta.watched_components.push(comp_id);
        builder.add_system(meta, Tally(tally.clone()), true);

        let mut world = builder.build().unwrap();
        let e = world.add_entity();
        world.entity_mut(e).unwrap().add(Marker);
        world.update();

        assert_eq!(*tally.borrow(), 1);
        assert_eq!(world.watchers_triggered.len(), 0);
        assert_eq!(world.watchers_triggered_set.len(), 0);
        assert!(world.component_watchers.values().all(|w| w.pop_notifications(|_| false).is_empty()));
    }
}
