//! Behavioral scenario fixtures (S1-S6) plus the reactive-cascade case,
//! exercised entirely through the public API rather than crate internals.
//! Focused per-module unit tests live alongside their code in `src/`.

use std::cell::RefCell;
use std::rc::Rc;

use reactive_ecs::prelude::*;

#[derive(Debug, Clone)]
struct Health {
    v: i32,
}
impl Component for Health {}

#[derive(Debug)]
struct Tag;
impl Component for Tag {}

#[derive(Debug)]
struct Spawned;
impl Component for Spawned {}

#[derive(Default)]
struct Log {
    added: Vec<EntityId>,
    modified: Vec<EntityId>,
    removed: Vec<EntityId>,
    update_calls: u32,
}

/// S1/S2: watches `Health`, and from its second `update()` onward bumps
/// every watched entity's `v` by one before the phase's reactive drain.
struct HealthTracker {
    log: Rc<RefCell<Log>>,
    health: CompId,
}

impl System for HealthTracker {
    fn update(&mut self, scope: &mut Scope<'_>) {
        let mut log = self.log.borrow_mut();
        log.update_calls += 1;
        let bump = log.update_calls > 1;
        drop(log);

        if bump {
            let entities = scope.entity_ids();
            for e in entities {
                let current = scope.world().entity_mut(e).unwrap().get::<Health>().unwrap().v;
                scope.world().entity_mut(e).unwrap().replace(Health { v: current + 1 });
            }
        }
    }

    fn on_added(&mut self, _scope: &mut Scope<'_>, batch: ReactiveBatch<'_>) {
        self.log.borrow_mut().added.extend_from_slice(batch.entities);
    }

    fn on_modified(&mut self, _scope: &mut Scope<'_>, batch: ReactiveBatch<'_>) {
        self.log.borrow_mut().modified.extend_from_slice(batch.entities);
    }

    fn on_removed(&mut self, _scope: &mut Scope<'_>, batch: ReactiveBatch<'_>) {
        self.log.borrow_mut().removed.extend_from_slice(batch.entities);
    }
}

fn all_of(comp_ids: &[CompId]) -> Vec<FilterDecl> {
    vec![FilterDecl {
        kind: FilterKind::AllOf,
        access: FilterAccess::ReadWrite,
        comp_ids: comp_ids.to_vec(),
    }]
}

#[test]
fn s1_and_s2_reactive_update_sequence() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut builder = World::builder(WorldConfig::default());
    let health = builder.component_id::<Health>();
    let log = Rc::new(RefCell::new(Log::default()));

    let mut meta = SystemMeta::new("health_tracker", CapabilitySet::from_caps(&[Capability::Update, Capability::Reactive]));
    meta.filters = all_of(&[health]);
    meta.watched_components.push(health);
    builder.add_system(meta, HealthTracker { log: log.clone(), health }, true);

    let mut world = builder.build().unwrap();
    let e = world.add_entity();
    world.entity_mut(e).unwrap().add(Health { v: 0 });

    // S1
    world.update();
    {
        let l = log.borrow();
        assert_eq!(l.added, vec![e]);
        assert_eq!(l.update_calls, 1);
        assert!(l.modified.is_empty());
    }
    assert_eq!(world.entity_mut(e).unwrap().get::<Health>().unwrap().v, 0);

    // S2
    world.update();
    {
        let l = log.borrow();
        assert_eq!(l.modified, vec![e]);
        assert_eq!(l.update_calls, 2);
    }
    assert_eq!(world.entity_mut(e).unwrap().get::<Health>().unwrap().v, 1);
}

#[test]
fn s3_add_then_remove_within_one_frame_cancels_added_but_keeps_removed() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut builder = World::builder(WorldConfig::default());
    let health = builder.component_id::<Health>();
    let log = Rc::new(RefCell::new(Log::default()));

    let mut meta = SystemMeta::new("health_watcher", CapabilitySet::from_caps(&[Capability::Reactive]));
    meta.watched_components.push(health);
    builder.add_system(meta, HealthTracker { log: log.clone(), health }, true);

    let mut world = builder.build().unwrap();
    let e = world.add_entity();
    // Tag keeps the entity alive once Health is removed below.
    world.entity_mut(e).unwrap().add(Tag);
    world.entity_mut(e).unwrap().add(Health { v: 0 });
    world.entity_mut(e).unwrap().remove::<Health>();

    world.update();

    let l = log.borrow();
    assert!(l.added.is_empty(), "cancelled add must not be dispatched");
    assert_eq!(l.removed, vec![e]);
    assert_ne!(world.get_entity(e).lifecycle(), LifecycleState::Destroyed);
}

struct ActivationLog {
    activated: Vec<EntityId>,
    deactivated: Vec<EntityId>,
}

struct ActivationListener {
    log: Rc<RefCell<ActivationLog>>,
}

impl System for ActivationListener {
    fn on_activated(&mut self, _scope: &mut Scope<'_>, entity: EntityId) {
        self.log.borrow_mut().activated.push(entity);
    }

    fn on_deactivated(&mut self, _scope: &mut Scope<'_>, entity: EntityId) {
        self.log.borrow_mut().deactivated.push(entity);
    }
}

#[test]
fn s4_deactivating_parent_cascades_and_spares_independently_deactivated_children() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut builder = World::builder(WorldConfig::default());
    let tag = builder.component_id::<Tag>();
    let log = Rc::new(RefCell::new(ActivationLog {
        activated: Vec::new(),
        deactivated: Vec::new(),
    }));

    let mut meta = SystemMeta::new("activation_listener", CapabilitySet::from_caps(&[Capability::ActivationListener]));
    meta.filters = all_of(&[tag]);
    builder.add_system(meta, ActivationListener { log: log.clone() }, true);

    let mut world = builder.build().unwrap();
    let parent = world.add_entity();
    let child_a = world.add_entity();
    let child_b = world.add_entity();
    for e in [parent, child_a, child_b] {
        world.entity_mut(e).unwrap().add(Tag);
    }
    world.entity_mut(child_a).unwrap().reparent(Some(parent));
    world.entity_mut(child_b).unwrap().reparent(Some(parent));

    // child_b is independently deactivated before the parent is touched.
    world.entity_mut(child_b).unwrap().deactivate();
    log.borrow_mut().deactivated.clear();

    world.entity_mut(parent).unwrap().deactivate();
    assert_eq!(world.get_entity(child_a).lifecycle(), LifecycleState::Deactivated);
    assert!(world.get_entity(child_a).was_deactivated_from_parent());
    assert_eq!(world.get_entity(child_b).lifecycle(), LifecycleState::Deactivated);
    assert!(!world.get_entity(child_b).was_deactivated_from_parent());

    world.entity_mut(parent).unwrap().activate();
    assert_eq!(world.get_entity(child_a).lifecycle(), LifecycleState::Live);
    assert_eq!(
        world.get_entity(child_b).lifecycle(),
        LifecycleState::Deactivated,
        "independently-deactivated child is not reactivated by its parent"
    );

    let l = log.borrow();
    assert!(l.activated.contains(&child_a));
    assert!(!l.activated.contains(&child_b), "child_b must not fire on_entity_activated");
}

struct NoopUpdateSystem;
impl System for NoopUpdateSystem {}

#[test]
fn s5_reordered_identical_filters_share_one_canonical_context() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut builder = World::builder(WorldConfig::default());
    let a = builder.component_id::<Tag>();
    let b = builder.component_id::<Spawned>();

    let mut meta1 = SystemMeta::new("s1", CapabilitySet::from_caps(&[Capability::Update]));
    meta1.filters = all_of(&[a, b]);
    let mut meta2 = SystemMeta::new("s2", CapabilitySet::from_caps(&[Capability::Update]));
    meta2.filters = all_of(&[b, a]);

    builder.add_system(meta1, NoopUpdateSystem, true);
    builder.add_system(meta2, NoopUpdateSystem, true);

    let world = builder.build().unwrap();
    assert_eq!(world.context_count(), 1);
}

#[test]
fn s6_uniqueness_violation_asserts_in_diagnostics_mode() {
    let _ = tracing_subscriber::fmt::try_init();
    let config = WorldConfig {
        diagnostics: true,
        entity_capacity_hint: 0,
    };
    let mut builder = World::builder(config);
    let mut world = builder.build().unwrap();

    let tag = world.component_id::<Tag>();
    world.mark_unique(tag);
    let e1 = world.add_entity();
    world.entity_mut(e1).unwrap().add(Tag);
    let e2 = world.add_entity();
    world.entity_mut(e2).unwrap().add(Tag);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        world.try_get_unique_entity::<Tag>()
    }));
    assert!(result.is_err(), "expected the uniqueness assertion to panic");
}

/// Watches `Tag`; on_added for `Tag` adds `Spawned`, triggering a second
/// reactive wave for whatever watches `Spawned`.
struct CascadeSource;

impl System for CascadeSource {
    fn on_added(&mut self, scope: &mut Scope<'_>, batch: ReactiveBatch<'_>) {
        for &e in batch.entities {
            scope.world().entity_mut(e).unwrap().add(Spawned);
        }
    }
}

struct CascadeSink {
    seen: Rc<RefCell<Vec<EntityId>>>,
}

impl System for CascadeSink {
    fn on_added(&mut self, _scope: &mut Scope<'_>, batch: ReactiveBatch<'_>) {
        self.seen.borrow_mut().extend_from_slice(batch.entities);
    }
}

#[test]
fn reactive_drain_cascades_to_a_second_wave() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut builder = World::builder(WorldConfig::default());
    let tag = builder.component_id::<Tag>();
    let spawned = builder.component_id::<Spawned>();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let mut source_meta = SystemMeta::new("cascade_source", CapabilitySet::from_caps(&[Capability::Reactive]));
    source_meta.watched_components.push(tag);
    builder.add_system(source_meta, CascadeSource, true);

    let mut sink_meta = SystemMeta::new("cascade_sink", CapabilitySet::from_caps(&[Capability::Reactive]));
    sink_meta.watched_components.push(spawned);
    builder.add_system(sink_meta, CascadeSink { seen: seen.clone() }, true);

    let mut world = builder.build().unwrap();
    let e = world.add_entity();
    world.entity_mut(e).unwrap().add(Tag);

    world.update();

    assert_eq!(*seen.borrow(), vec![e], "the second reactive wave triggered by the first must still be drained within one update()");
    assert!(world.entity_mut(e).unwrap().has::<Spawned>());
}
