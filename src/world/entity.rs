use crate::world::position::Position;

/// Globally unique unit id. Real units are strictly positive; the negated
/// value is the shadow identity shown to the owner of a disguised unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Pc,
    Mob,
    Npc,
    Pet,
    Homunculus,
    Mercenary,
    Elemental,
    Item,
    Chat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub position: Position,
    /// Class the unit is disguised as, if any.
    pub disguise: Option<u16>,
    /// Player controlling this unit (homunculus, mercenary, pet...).
    pub owner: Option<EntityId>,
    /// Administratively invisible (GM hide).
    pub hidden: bool,
}

impl EntityId {
    pub fn is_real(self) -> bool {
        self.0 > 0
    }

    pub fn wire(self) -> i32 {
        self.0
    }

    pub fn shadow(self) -> i32 {
        self.0.wrapping_neg()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Entity {
    pub fn new(id: EntityId, kind: EntityKind, position: Position) -> Self {
        Self {
            id,
            kind,
            position,
            disguise: None,
            owner: None,
            hidden: false,
        }
    }

    pub fn pc(id: i32, position: Position) -> Self {
        Self::new(EntityId(id), EntityKind::Pc, position)
    }

    pub fn with_owner(mut self, owner: EntityId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn disguised_as(mut self, class: u16) -> Self {
        self.disguise = Some(class);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn is_player(&self) -> bool {
        self.kind == EntityKind::Pc
    }

    pub fn is_disguised(&self) -> bool {
        self.disguise.is_some()
    }

    /// The player whose client controls this unit.
    pub fn owner_id(&self) -> EntityId {
        match self.owner {
            Some(owner) => owner,
            None => self.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_is_negated_id() {
        let id = EntityId(150_000);
        assert!(id.is_real());
        assert_eq!(id.shadow(), -150_000);
        assert!(!EntityId(id.shadow()).is_real());
    }

    #[test]
    fn owner_defaults_to_self() {
        let pc = Entity::pc(10, Position::new(1, 5, 5));
        assert_eq!(pc.owner_id(), EntityId(10));
        let homun = Entity::new(EntityId(11), EntityKind::Homunculus, Position::new(1, 5, 6))
            .with_owner(EntityId(10));
        assert_eq!(homun.owner_id(), EntityId(10));
    }
}
