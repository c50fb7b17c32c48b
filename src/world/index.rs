use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::world::entity::{Entity, EntityId};
use crate::world::position::{MapId, Position};

/// Cells per block edge in the spatial grid.
pub const BLOCK_SIZE: u16 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKind {
    Party,
    Guild,
    Clan,
    Battleground,
    Duel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupRef {
    pub kind: GroupKind,
    pub id: u32,
}

/// Read-only queries the broadcast engine needs from the world.
///
/// Implementations must be side-effect free; the resolver may call any of
/// these several times while computing one audience.
pub trait WorldView {
    fn entity(&self, id: EntityId) -> Option<&Entity>;
    /// Player units inside the square of `radius` cells around `center`.
    fn players_in_area(&self, center: Position, radius: u16) -> Vec<EntityId>;
    fn players_on_map(&self, map: MapId) -> Vec<EntityId>;
    fn group_of(&self, entity: EntityId, kind: GroupKind) -> Option<GroupRef>;
    fn roster(&self, group: GroupRef) -> Vec<EntityId>;
    /// Observers subscribed to a group's traffic without being members.
    fn spies(&self, group: GroupRef) -> Vec<EntityId>;
    fn chat_room_of(&self, entity: EntityId) -> Option<EntityId>;
    fn chat_members(&self, room: EntityId) -> Vec<EntityId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlockKey {
    map: MapId,
    bx: u16,
    by: u16,
}

impl BlockKey {
    fn of(position: Position) -> Self {
        Self {
            map: position.map,
            bx: position.x / BLOCK_SIZE,
            by: position.y / BLOCK_SIZE,
        }
    }
}

/// In-memory spatial and social index.
#[derive(Debug, Default)]
pub struct WorldIndex {
    entities: HashMap<EntityId, Entity>,
    blocks: HashMap<BlockKey, BTreeSet<EntityId>>,
    memberships: HashMap<(EntityId, GroupKind), u32>,
    rosters: BTreeMap<GroupRef, BTreeSet<EntityId>>,
    spies: BTreeMap<GroupRef, BTreeSet<EntityId>>,
    chat_rooms: BTreeMap<EntityId, Vec<EntityId>>,
    chat_of: HashMap<EntityId, EntityId>,
}

impl WorldIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn insert(&mut self, entity: Entity) {
        if self.entities.contains_key(&entity.id) {
            self.remove(entity.id);
        }
        self.blocks
            .entry(BlockKey::of(entity.position))
            .or_default()
            .insert(entity.id);
        self.entities.insert(entity.id, entity);
    }

    /// Drops the unit and every membership it holds.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.remove(&id)?;
        self.unlink_block(id, entity.position);
        let kinds = [
            GroupKind::Party,
            GroupKind::Guild,
            GroupKind::Clan,
            GroupKind::Battleground,
            GroupKind::Duel,
        ];
        for kind in kinds {
            self.leave_group(id, kind);
        }
        for watchers in self.spies.values_mut() {
            watchers.remove(&id);
        }
        self.leave_chat(id);
        self.chat_rooms.remove(&id);
        Some(entity)
    }

    pub fn move_to(&mut self, id: EntityId, position: Position) -> bool {
        let Some(old) = self.entities.get(&id).map(|entity| entity.position) else {
            return false;
        };
        if BlockKey::of(old) != BlockKey::of(position) {
            self.unlink_block(id, old);
            self.blocks
                .entry(BlockKey::of(position))
                .or_default()
                .insert(id);
        }
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.position = position;
        }
        true
    }

    pub fn set_hidden(&mut self, id: EntityId, hidden: bool) -> bool {
        match self.entities.get_mut(&id) {
            Some(entity) => {
                entity.hidden = hidden;
                true
            }
            None => false,
        }
    }

    pub fn set_disguise(&mut self, id: EntityId, disguise: Option<u16>) -> bool {
        match self.entities.get_mut(&id) {
            Some(entity) => {
                entity.disguise = disguise;
                true
            }
            None => false,
        }
    }

    /// A unit belongs to at most one group of each kind.
    pub fn join_group(&mut self, id: EntityId, group: GroupRef) {
        self.leave_group(id, group.kind);
        self.memberships.insert((id, group.kind), group.id);
        self.rosters.entry(group).or_default().insert(id);
    }

    pub fn leave_group(&mut self, id: EntityId, kind: GroupKind) -> Option<GroupRef> {
        let group_id = self.memberships.remove(&(id, kind))?;
        let group = GroupRef { kind, id: group_id };
        if let Some(roster) = self.rosters.get_mut(&group) {
            roster.remove(&id);
            if roster.is_empty() {
                self.rosters.remove(&group);
            }
        }
        Some(group)
    }

    pub fn add_spy(&mut self, spy: EntityId, group: GroupRef) {
        self.spies.entry(group).or_default().insert(spy);
    }

    pub fn remove_spy(&mut self, spy: EntityId, group: GroupRef) {
        if let Some(watchers) = self.spies.get_mut(&group) {
            watchers.remove(&spy);
        }
    }

    pub fn join_chat(&mut self, id: EntityId, room: EntityId) {
        self.leave_chat(id);
        self.chat_rooms.entry(room).or_default().push(id);
        self.chat_of.insert(id, room);
    }

    pub fn leave_chat(&mut self, id: EntityId) -> Option<EntityId> {
        let room = self.chat_of.remove(&id)?;
        if let Some(members) = self.chat_rooms.get_mut(&room) {
            members.retain(|member| *member != id);
            if members.is_empty() {
                self.chat_rooms.remove(&room);
            }
        }
        Some(room)
    }

    fn unlink_block(&mut self, id: EntityId, position: Position) {
        let key = BlockKey::of(position);
        if let Some(block) = self.blocks.get_mut(&key) {
            block.remove(&id);
            if block.is_empty() {
                self.blocks.remove(&key);
            }
        }
    }
}

impl WorldView for WorldIndex {
    fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    fn players_in_area(&self, center: Position, radius: u16) -> Vec<EntityId> {
        let area = center.area(radius);
        let mut found = Vec::new();
        for by in area.min_y / BLOCK_SIZE..=area.max_y / BLOCK_SIZE {
            for bx in area.min_x / BLOCK_SIZE..=area.max_x / BLOCK_SIZE {
                let key = BlockKey {
                    map: area.map,
                    bx,
                    by,
                };
                let Some(block) = self.blocks.get(&key) else {
                    continue;
                };
                for id in block {
                    if let Some(entity) = self.entities.get(id) {
                        if entity.is_player() && area.contains(entity.position) {
                            found.push(*id);
                        }
                    }
                }
            }
        }
        found.sort();
        found
    }

    fn players_on_map(&self, map: MapId) -> Vec<EntityId> {
        let mut found: Vec<EntityId> = self
            .entities
            .values()
            .filter(|entity| entity.is_player() && entity.position.map == map)
            .map(|entity| entity.id)
            .collect();
        found.sort();
        found
    }

    fn group_of(&self, entity: EntityId, kind: GroupKind) -> Option<GroupRef> {
        self.memberships
            .get(&(entity, kind))
            .map(|id| GroupRef { kind, id: *id })
    }

    fn roster(&self, group: GroupRef) -> Vec<EntityId> {
        self.rosters
            .get(&group)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    fn spies(&self, group: GroupRef) -> Vec<EntityId> {
        self.spies
            .get(&group)
            .map(|watchers| watchers.iter().copied().collect())
            .unwrap_or_default()
    }

    fn chat_room_of(&self, entity: EntityId) -> Option<EntityId> {
        self.chat_of.get(&entity).copied()
    }

    fn chat_members(&self, room: EntityId) -> Vec<EntityId> {
        self.chat_rooms.get(&room).cloned().unwrap_or_default()
    }
}
