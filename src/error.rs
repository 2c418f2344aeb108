//! The engine's error taxonomy.
//!
//! Fatal kinds are returned as `Result<_, EcsError>` and are meant to be propagated
//! with `?` out of the call that raised them; Warn-policy kinds never reach this
//! type; they are logged through `tracing::warn!` at the call site and the
//! operation becomes a no-op.

use thiserror::Error;

use crate::component::CompId;
use crate::entity::EntityId;
use crate::system::SystemId;

/// Fatal errors raised by the engine.
///
/// See the crate-level error taxonomy: `DuplicateAdd`, `ReplaceAbsent`, and
/// `UseAfterDestroy` are Warn-policy and are never constructed as an `EcsError`;
/// they are logged in place instead.
#[derive(Debug, Error)]
pub enum EcsError {
    /// `Entity::get(T)` was called for a component type not present on the entity.
    #[error("entity {entity} is missing component {comp_id:?} ({type_name})")]
    MissingComponent {
        entity: EntityId,
        comp_id: CompId,
        type_name: &'static str,
    },

    /// A type was registered as both a tracked component and a tracked message
    /// type, or under an interface it does not belong to.
    #[error("type {type_name} cannot be registered as a component/message index entry: {reason}")]
    InvalidType {
        type_name: &'static str,
        reason: &'static str,
    },

    /// A system declared `Reactive` without a `watcher` list, or `Messager`
    /// without a `messager` list.
    #[error("system {system:?} ({name}) has bad metadata: {reason}")]
    BadMetadata {
        system: SystemId,
        name: &'static str,
        reason: &'static str,
    },
}
