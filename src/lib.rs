//! `reactive_ecs` is an entity/component/message runtime: a [`world::World`]
//! that owns entities, their components, the systems that operate on them,
//! and the reactive plumbing that notifies systems when components change.
//!
//! The crate is a library consumed by a host application — typically a game
//! or simulation loop — and does not own the main loop, rendering, or IO. It
//! is built around three tightly-coupled subsystems:
//!
//! - [`entity`] — the entity/component store, with lifecycle (add / replace
//!   / remove / destroy / activate / deactivate), a parent-child hierarchy,
//!   and an in-frame message channel.
//! - [`context`] — canonical subsets of entities matching a filter
//!   expression over component indices, shared across systems that declare
//!   identical filters.
//! - [`watcher`] — per-component observers that coalesce add/remove/modify/
//!   enable/disable events within a frame and dispatch them to reactive
//!   systems in a defined order, including cascades.
//!
//! [`system`] ties these together with a capability-bitset system trait, and
//! [`world`] is the orchestrator a host drives through per-frame phase calls
//! (`early_start`, `start`, `update`, `late_update`, `fixed_update`, `exit`).
//!
//! # Getting started
//!
//! ```rust
//! use reactive_ecs::prelude::*;
//!
//! #[derive(Debug)]
//! struct Health(i32);
//! impl Component for Health {}
//!
//! struct PrintOnDamage {
//!     health: CompId,
//! }
//! impl System for PrintOnDamage {
//!     fn on_modified(&mut self, scope: &mut Scope<'_>, batch: ReactiveBatch<'_>) {
//!         for &entity in batch.entities {
//!             let hp = scope.world().entity_mut(entity).unwrap().get::<Health>().unwrap().0;
//!             println!("{entity} now has {hp} hp");
//!         }
//!     }
//! }
//!
//! let mut builder = World::builder(WorldConfig::default());
//! builder.register_component::<Health>();
//! let health = builder.component_id::<Health>();
//!
//! let mut meta = SystemMeta::new("print_on_damage", CapabilitySet::from_caps(&[Capability::Reactive]));
//! meta.watched_components.push(health);
//! builder.add_system(meta, PrintOnDamage { health }, true);
//!
//! let mut world = builder.build().unwrap();
//! let e = world.add_entity();
//! world.entity_mut(e).unwrap().add(Health(10));
//! world.update();
//! world.entity_mut(e).unwrap().replace(Health(8));
//! world.update();
//! ```
//!
//! # Feature flags
//!
//! * `diagnostics`: enables extra runtime assertions (uniqueness checks via
//!   [`world::World::try_get_unique_entity`]) at a small performance cost.
//!   Intended for development and test builds; see [`world::WorldConfig`].

pub mod component;
pub mod context;
pub mod entity;
pub mod error;
pub mod event;
pub mod system;
pub mod watcher;
pub mod world;

pub mod prelude {
    pub use crate::component::{CompId, Component, ComponentIndex, Interface, Message};
    pub use crate::context::{AccessKind, FilterAccess, FilterDecl, FilterKind};
    pub use crate::entity::{EntityId, LifecycleState};
    pub use crate::error::EcsError;
    pub use crate::event::Token;
    pub use crate::system::{Capability, CapabilitySet, ReactiveBatch, Scope, System, SystemId, SystemMeta};
    pub use crate::watcher::NotificationKind;
    pub use crate::world::{EntityMut, World, WorldBuilder, WorldConfig};
}
