use crate::world::entity::{Entity, EntityId};
use crate::world::index::{GroupKind, WorldView};

/// Restricts an audience beyond what its scope computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisibilityPolicy {
    #[default]
    Everyone,
    /// Only the origin's own client and players sharing its party or guild.
    AlliesOnly,
}

/// The player whose client controls `entity`.
pub fn owner_of(entity: &Entity) -> EntityId {
    entity.owner_id()
}

/// Identity `entity` presents to `recipient`.
///
/// A disguised unit shows its shadow id to its own owner and its real id to
/// everyone else.
pub fn present_id(entity: &Entity, recipient: EntityId) -> EntityId {
    if entity.is_disguised() && recipient == owner_of(entity) {
        EntityId(entity.id.shadow())
    } else {
        entity.id
    }
}

/// Whether a viewer may learn that `entity` exists at all.
pub fn can_see(entity: &Entity, viewer: EntityId, viewer_sees_hidden: bool) -> bool {
    !entity.hidden || viewer_sees_hidden || viewer == entity.id || viewer == owner_of(entity)
}

/// Party or guild shared with the origin's controlling player.
pub fn is_ally<W: WorldView + ?Sized>(world: &W, origin: &Entity, recipient: EntityId) -> bool {
    let owner = owner_of(origin);
    if recipient == owner || recipient == origin.id {
        return true;
    }
    [GroupKind::Party, GroupKind::Guild].into_iter().any(|kind| {
        match (world.group_of(owner, kind), world.group_of(recipient, kind)) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        }
    })
}

impl VisibilityPolicy {
    pub fn admits<W: WorldView + ?Sized>(self, world: &W, origin: &Entity, recipient: EntityId) -> bool {
        match self {
            VisibilityPolicy::Everyone => true,
            VisibilityPolicy::AlliesOnly => is_ally(world, origin, recipient),
        }
    }
}
