//! System registration metadata and the capability-based system trait.
//!
//! The original engine's systems each implement exactly the interfaces they
//! need (`IEarlyStartupSystem`, `IReactiveSystem`, ...) and the host queries
//! `system is IFoo` to decide whether to call a given hook. Rust has no
//! interface-query-at-runtime story that doesn't involve `Any` downcasting on
//! a hot path, so this is replaced per the redesign notes: every system
//! implements one [`System`] trait with a default no-op body for each hook,
//! and a [`SystemMeta`] declares — as plain data, resolved once at
//! registration — which [`Capability`] bits are actually meaningful for that
//! system. The `World` consults the bitset to decide whether to run a phase
//! hook or wire up a watcher at all; it never has to ask "does this object
//! implement X" once registration is done. The bitset itself reuses
//! `bit_set::BitSet`, the same crate `legion`'s scheduler used for its
//! archetype-access masks (`schedule.rs`'s `ArchetypeAccess::Some(BitSet)`).

use bit_set::BitSet;

use crate::component::{CompId, Message};
use crate::context::{Context, ContextId, FilterDecl};
use crate::entity::EntityId;
use crate::world::World;

/// A unique, registration-order identifier for a system within one `World`,
/// in the same newtype style as [`crate::entity::EntityId`] and
/// [`crate::context::ContextId`] — simpler than `legion`'s `SystemId` (a
/// `name` plus a `TypeId`), since registration order is already unique here
/// and the name is carried separately on [`SystemMeta`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SystemId(pub(crate) u32);

impl SystemId {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SystemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "System({})", self.0)
    }
}

/// The phases and reactive hooks a system can opt into.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Capability {
    EarlyStartup,
    Startup,
    Exit,
    Update,
    LateUpdate,
    FixedUpdate,
    Render,
    Reactive,
    Messager,
    ActivationListener,
}

impl Capability {
    const ALL: [Capability; 10] = [
        Capability::EarlyStartup,
        Capability::Startup,
        Capability::Exit,
        Capability::Update,
        Capability::LateUpdate,
        Capability::FixedUpdate,
        Capability::Render,
        Capability::Reactive,
        Capability::Messager,
        Capability::ActivationListener,
    ];

    fn bit(self) -> usize {
        self as usize
    }

    /// Render hooks always run while the world is paused (§5.3).
    pub fn always_runs_while_paused(self) -> bool {
        matches!(self, Capability::Render)
    }
}

/// A capability bitset, built once at registration and consulted by the
/// `World` on every phase dispatch and watcher-wiring decision.
#[derive(Clone, Debug, Default)]
pub struct CapabilitySet(BitSet);

impl CapabilitySet {
    pub fn new() -> Self {
        CapabilitySet(BitSet::with_capacity(Capability::ALL.len()))
    }

    pub fn from_caps(caps: &[Capability]) -> Self {
        let mut set = Self::new();
        for cap in caps {
            set.insert(*cap);
        }
        set
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0.insert(cap.bit());
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(cap.bit())
    }
}

/// Plain-data registration record for one system (§6 "system metadata").
///
/// `filters` describes the entity subset the system's `Context`-taking hooks
/// run over; the `World` resolves it to a shared [`Context`] at registration
/// (§4.3). `watched_components`/`watched_messages` are the component/message
/// ids a `Reactive`/`Messager` system wants notifications for — already
/// resolved to [`CompId`]s by the caller (typically via
/// `World::component_id::<T>()`), rather than carried as generic type
/// parameters, since this record is meant to be built and stored as data.
pub struct SystemMeta {
    pub name: &'static str,
    pub capabilities: CapabilitySet,
    pub filters: Vec<FilterDecl>,
    pub watched_components: Vec<CompId>,
    pub watched_messages: Vec<CompId>,
    /// Keeps running during a world pause (§5.3).
    pub do_not_pause: bool,
    /// Forces pausable-classification regardless of `Render`/`do_not_pause`:
    /// an active system with this set is always deactivated on `pause()` and
    /// reactivated on `resume()`, overriding both the `Render`-is-never-
    /// pausable rule and `do_not_pause` (§5.3, highest precedence).
    pub include_on_pause: bool,
    /// Play-on-pause: inactive under normal play, activated only while the
    /// world is paused and deactivated again on `resume()` (§5.3).
    pub on_pause: bool,
}

impl SystemMeta {
    pub fn new(name: &'static str, capabilities: CapabilitySet) -> Self {
        SystemMeta {
            name,
            capabilities,
            filters: Vec::new(),
            watched_components: Vec::new(),
            watched_messages: Vec::new(),
            do_not_pause: false,
            include_on_pause: false,
            on_pause: false,
        }
    }

    /// Checks the internal-consistency invariants registration relies on: a
    /// `Reactive` system must declare at least one watched component, a
    /// `Messager` system must declare at least one watched message. Returns
    /// the `BadMetadata` reason string on failure, for the caller to wrap in
    /// an [`crate::error::EcsError::BadMetadata`].
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.capabilities.contains(Capability::Reactive) && self.watched_components.is_empty() {
            return Err("Reactive system declared no watched_components");
        }
        if self.capabilities.contains(Capability::Messager) && self.watched_messages.is_empty() {
            return Err("Messager system declared no watched_messages");
        }
        Ok(())
    }
}

/// A per-entity batch handed to a `Reactive` hook, already filtered to one
/// notification kind (§4.6). Reactive hooks never see the `ComponentWatcher`
/// that produced the batch, only the resolved entity list.
pub struct ReactiveBatch<'a> {
    pub comp_id: CompId,
    pub entities: &'a [EntityId],
}

/// The hand a system is given at call time: exclusive `World` access plus
/// the id of the `Context` it was registered against.
///
/// §6 describes phase hooks as taking a bare `Context` and reactive/messager
/// hooks as taking `(World, Entities)`/`(World, Entity, Message)`. Handing
/// every hook a live `&Context` *and* a `&mut World` at once is not
/// representable in Rust — `Context` lives inside `World`'s own tables, so
/// the two borrows would alias. `Scope` is the idiomatic resolution: it
/// holds only the `&mut World`, and derives a `&Context` on demand
/// (non-overlapping in time with any `&mut World` access the hook makes
/// through [`Scope::world`]), which is both what every hook in this engine
/// actually needs and what the spec's wording loosely describes.
pub struct Scope<'w> {
    pub(crate) world: &'w mut World,
    pub(crate) ctx_id: ContextId,
}

impl<'w> Scope<'w> {
    pub(crate) fn new(world: &'w mut World, ctx_id: ContextId) -> Self {
        Scope { world, ctx_id }
    }

    /// The context this system was registered against.
    pub fn context(&self) -> &Context {
        self.world
            .context_by_id(self.ctx_id)
            .expect("a system's context is never torn down while the system is registered")
    }

    /// The context's current active member ids, snapshotted so the caller
    /// can iterate while also mutating the world through [`Scope::world`].
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.context().entities.keys().copied().collect()
    }

    pub fn world(&mut self) -> &mut World {
        self.world
    }

    pub fn world_ref(&self) -> &World {
        self.world
    }
}

/// The trait every system implements. Every hook has a default no-op body;
/// a system overrides only the ones its [`SystemMeta::capabilities`]
/// declares. The `World` only calls a hook when the matching bit is set, so
/// an un-overridden default is never reached on the hot path — it exists to
/// let one type implement an arbitrary subset of hooks without the host
/// hand-rolling per-capability trait objects.
pub trait System {
    fn early_start(&mut self, _scope: &mut Scope<'_>) {}
    fn start(&mut self, _scope: &mut Scope<'_>) {}
    fn exit(&mut self, _scope: &mut Scope<'_>) {}
    fn update(&mut self, _scope: &mut Scope<'_>) {}
    fn late_update(&mut self, _scope: &mut Scope<'_>) {}
    fn fixed_update(&mut self, _scope: &mut Scope<'_>) {}
    fn render(&mut self, _scope: &mut Scope<'_>) {}

    fn on_added(&mut self, _scope: &mut Scope<'_>, _batch: ReactiveBatch<'_>) {}
    fn on_removed(&mut self, _scope: &mut Scope<'_>, _batch: ReactiveBatch<'_>) {}
    fn on_modified(&mut self, _scope: &mut Scope<'_>, _batch: ReactiveBatch<'_>) {}
    fn on_enabled(&mut self, _scope: &mut Scope<'_>, _batch: ReactiveBatch<'_>) {}
    fn on_disabled(&mut self, _scope: &mut Scope<'_>, _batch: ReactiveBatch<'_>) {}
    /// Fired synchronously at the point of removal, not batched through the
    /// reactive drain (§4.4: "not queued").
    fn on_before_removing(&mut self, _scope: &mut Scope<'_>, _batch: ReactiveBatch<'_>) {}
    /// Fired synchronously at the point of modification, not batched.
    fn on_before_modifying(&mut self, _scope: &mut Scope<'_>, _batch: ReactiveBatch<'_>) {}

    fn on_message(&mut self, _scope: &mut Scope<'_>, _entity: EntityId, _message: &dyn Message) {}

    fn on_activated(&mut self, _scope: &mut Scope<'_>, _entity: EntityId) {}
    fn on_deactivated(&mut self, _scope: &mut Scope<'_>, _entity: EntityId) {}
}

/// Placeholder installed in a system's slot for the duration of its own
/// call, so the real system can be taken out by value (sidestepping the
/// aliasing `Scope` would otherwise hit — see `World::run_phase`) without
/// leaving the slot empty. Grounded in the same take-then-restore shape
/// `bevy_legion`'s scheduler (`schedule.rs`) uses to hand a `Runnable` to a
/// worker thread and reclaim it afterwards.
pub(crate) struct NoopSystem;
impl System for NoopSystem {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_set_contains_only_inserted_bits() {
        let caps = CapabilitySet::from_caps(&[Capability::Update, Capability::Reactive]);
        assert!(caps.contains(Capability::Update));
        assert!(caps.contains(Capability::Reactive));
        assert!(!caps.contains(Capability::Startup));
        assert!(!caps.contains(Capability::Render));
    }

    #[test]
    fn reactive_without_watched_components_is_invalid() {
        let meta = SystemMeta::new("broken", CapabilitySet::from_caps(&[Capability::Reactive]));
        assert_eq!(
            meta.validate(),
            Err("Reactive system declared no watched_components")
        );
    }

    #[test]
    fn messager_without_watched_messages_is_invalid() {
        let meta = SystemMeta::new("broken", CapabilitySet::from_caps(&[Capability::Messager]));
        assert_eq!(
            meta.validate(),
            Err("Messager system declared no watched_messages")
        );
    }

    #[test]
    fn fully_declared_reactive_system_is_valid() {
        let mut index = crate::component::ComponentIndex::new();
        struct Health;
        impl std::fmt::Debug for Health {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "Health")
            }
        }
        impl crate::component::Component for Health {}

        let mut meta = SystemMeta::new("tracker", CapabilitySet::from_caps(&[Capability::Reactive]));
        meta.watched_components.push(index.id_of::<Health>());
        assert_eq!(meta.validate(), Ok(()));
    }

    #[test]
    fn render_always_runs_while_paused() {
        assert!(Capability::Render.always_runs_while_paused());
        assert!(!Capability::Update.always_runs_while_paused());
    }
}
