use std::collections::{HashMap, HashSet};

use log::trace;

use crate::net::error::EncodeError;
use crate::net::schema::Epoch;
use crate::net::session::{ConnectionId, SessionTable};
use crate::net::visibility::{can_see, present_id, VisibilityPolicy};
use crate::world::entity::{Entity, EntityId, EntityKind};
use crate::world::index::{GroupKind, WorldView};

/// Exclusions for area scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AreaFlags {
    pub without_self: bool,
    /// Skip players sitting in any chat room.
    pub without_chatting: bool,
    /// Skip players in the origin's own chat room.
    pub without_same_chat: bool,
}

impl AreaFlags {
    pub const NONE: AreaFlags = AreaFlags {
        without_self: false,
        without_chatting: false,
        without_same_chat: false,
    };
    pub const WITHOUT_SELF: AreaFlags = AreaFlags {
        without_self: true,
        without_chatting: false,
        without_same_chat: false,
    };
    pub const WITHOUT_CHATTING: AreaFlags = AreaFlags {
        without_self: true,
        without_chatting: true,
        without_same_chat: false,
    };
    pub const WITHOUT_SAME_CHAT: AreaFlags = AreaFlags {
        without_self: false,
        without_chatting: false,
        without_same_chat: true,
    };
}

/// Filter applied to a party, guild or battleground roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterVariant {
    All,
    WithoutSelf,
    SameMap,
    SameMapWithoutSelf,
    Area,
    AreaWithoutSelf,
    /// Members not currently on a battleground team.
    NoBattleground,
}

impl RosterVariant {
    fn excludes_self(self) -> bool {
        matches!(
            self,
            RosterVariant::WithoutSelf
                | RosterVariant::SameMapWithoutSelf
                | RosterVariant::AreaWithoutSelf
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastScope {
    All,
    SameMap,
    Area(AreaFlags),
    /// Hearable radius, skipping chatters and the speaker.
    AreaChat,
    /// `room` defaults to the origin itself when it is a chat room, else the
    /// room the origin sits in.
    Chat {
        room: Option<EntityId>,
        without_self: bool,
    },
    Party(RosterVariant),
    Guild(RosterVariant),
    Battleground(RosterVariant),
    Clan,
    Duel {
        without_self: bool,
    },
    SelfOnly,
}

impl BroadcastScope {
    fn hides_invisible_origin(self) -> bool {
        matches!(
            self,
            BroadcastScope::All
                | BroadcastScope::SameMap
                | BroadcastScope::Area(_)
                | BroadcastScope::AreaChat
        )
    }

    /// Group whose spies get a copy regardless of roster filtering.
    fn spied_group(self) -> Option<GroupKind> {
        match self {
            BroadcastScope::Party(_) => Some(GroupKind::Party),
            BroadcastScope::Guild(_) => Some(GroupKind::Guild),
            BroadcastScope::Clan => Some(GroupKind::Clan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverSettings {
    /// Half-width of the square a client can see.
    pub area_size: u16,
    /// Subtracted from `area_size` for the hearable radius.
    pub chat_area_shrink: u16,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            area_size: 14,
            chat_area_shrink: 5,
        }
    }
}

impl ResolverSettings {
    pub fn chat_radius(&self) -> u16 {
        self.area_size.saturating_sub(self.chat_area_shrink)
    }
}

/// One resolved recipient with the session it is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recipient {
    pub entity: EntityId,
    pub connection: ConnectionId,
    pub epoch: Epoch,
}

/// Inputs a frame builder may depend on. Recipients sharing a context share
/// one encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameContext {
    pub epoch: Epoch,
    pub presented_id: EntityId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryReport {
    pub resolved: usize,
    pub delivered: usize,
    /// Audience members with no open session.
    pub unavailable: usize,
    /// Recipients whose epoch has no encoding of the message.
    pub skipped: usize,
    /// Distinct encodings built.
    pub variants: usize,
}

/// Computes audiences against a world snapshot and appends frames to the
/// chosen sessions' outbound queues.
pub struct Resolver<'w, W: WorldView + ?Sized> {
    world: &'w W,
    settings: ResolverSettings,
}

impl<'w, W: WorldView + ?Sized> Resolver<'w, W> {
    pub fn new(world: &'w W, settings: ResolverSettings) -> Self {
        Self { world, settings }
    }

    pub fn settings(&self) -> ResolverSettings {
        self.settings
    }

    /// Entity ids that must hear about `origin`, duplicates removed, roster
    /// and area members first and spies after.
    pub fn audience(
        &self,
        sessions: &SessionTable,
        origin: &Entity,
        scope: BroadcastScope,
        policy: VisibilityPolicy,
    ) -> Vec<EntityId> {
        let mut primary = self.primary(sessions, origin, scope);
        if origin.hidden && scope.hides_invisible_origin() {
            primary.retain(|viewer| {
                let sees_hidden = sessions
                    .live_session_of(*viewer)
                    .map(|session| session.can_see_hidden())
                    .unwrap_or(false);
                can_see(origin, *viewer, sees_hidden)
            });
        }
        primary.retain(|viewer| policy.admits(self.world, origin, *viewer));

        let spies = scope
            .spied_group()
            .and_then(|kind| self.world.group_of(origin.id, kind))
            .map(|group| self.world.spies(group))
            .unwrap_or_default();

        let mut seen = HashSet::with_capacity(primary.len() + spies.len());
        primary
            .into_iter()
            .chain(spies)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Audience mapped to open sessions. The second value counts members
    /// that have none.
    pub fn recipients(
        &self,
        sessions: &SessionTable,
        origin: &Entity,
        scope: BroadcastScope,
        policy: VisibilityPolicy,
    ) -> (Vec<Recipient>, usize) {
        let audience = self.audience(sessions, origin, scope, policy);
        let mut recipients = Vec::with_capacity(audience.len());
        let mut unavailable = 0;
        for entity in audience {
            match sessions.live_session_of(entity) {
                Some(session) => recipients.push(Recipient {
                    entity,
                    connection: session.id(),
                    epoch: session.epoch(),
                }),
                None => unavailable += 1,
            }
        }
        (recipients, unavailable)
    }

    /// Sends one identity-free frame to every recipient.
    pub fn deliver(
        &self,
        sessions: &mut SessionTable,
        origin: &Entity,
        scope: BroadcastScope,
        policy: VisibilityPolicy,
        frame: &[u8],
    ) -> DeliveryReport {
        let (recipients, unavailable) = self.recipients(sessions, origin, scope, policy);
        let mut report = DeliveryReport {
            resolved: recipients.len(),
            unavailable,
            variants: usize::from(!recipients.is_empty()),
            ..DeliveryReport::default()
        };
        for recipient in &recipients {
            if let Some(session) = sessions.get_mut(recipient.connection) {
                if session.send(frame) {
                    report.delivered += 1;
                }
            }
        }
        trace!(
            "deliver {:?} from {}: {} of {} recipients",
            scope,
            origin.id,
            report.delivered,
            report.resolved
        );
        report
    }

    /// Sends a frame built per distinct `(epoch, presented id)` among the
    /// recipients. Every encoding is built before anything is queued, so a
    /// builder error leaves all sessions untouched.
    pub fn deliver_with<F>(
        &self,
        sessions: &mut SessionTable,
        origin: &Entity,
        scope: BroadcastScope,
        policy: VisibilityPolicy,
        mut builder: F,
    ) -> Result<DeliveryReport, EncodeError>
    where
        F: FnMut(FrameContext) -> Result<Option<Vec<u8>>, EncodeError>,
    {
        let (recipients, unavailable) = self.recipients(sessions, origin, scope, policy);
        let mut variants: HashMap<FrameContext, Option<Vec<u8>>> = HashMap::new();
        let mut plan = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            let context = FrameContext {
                epoch: recipient.epoch,
                presented_id: present_id(origin, recipient.entity),
            };
            if !variants.contains_key(&context) {
                let frame = builder(context)?;
                variants.insert(context, frame);
            }
            plan.push((recipient.connection, context));
        }

        let mut report = DeliveryReport {
            resolved: recipients.len(),
            unavailable,
            variants: variants.values().filter(|frame| frame.is_some()).count(),
            ..DeliveryReport::default()
        };
        for (connection, context) in plan {
            let Some(Some(frame)) = variants.get(&context) else {
                report.skipped += 1;
                continue;
            };
            if let Some(session) = sessions.get_mut(connection) {
                if session.send(frame) {
                    report.delivered += 1;
                }
            }
        }
        trace!(
            "deliver_with {:?} from {}: {} of {} recipients, {} variants",
            scope,
            origin.id,
            report.delivered,
            report.resolved,
            report.variants
        );
        Ok(report)
    }

    fn primary(&self, sessions: &SessionTable, origin: &Entity, scope: BroadcastScope) -> Vec<EntityId> {
        match scope {
            BroadcastScope::SelfOnly => vec![origin.id],
            BroadcastScope::All => sessions
                .authenticated()
                .filter_map(|session| session.entity())
                .collect(),
            BroadcastScope::SameMap => self.world.players_on_map(origin.position.map),
            BroadcastScope::Area(flags) => self.area(origin, self.settings.area_size, flags),
            BroadcastScope::AreaChat => {
                self.area(origin, self.settings.chat_radius(), AreaFlags::WITHOUT_CHATTING)
            }
            BroadcastScope::Chat { room, without_self } => {
                let room = room.or_else(|| {
                    if origin.kind == EntityKind::Chat {
                        Some(origin.id)
                    } else {
                        self.world.chat_room_of(origin.id)
                    }
                });
                let Some(room) = room else {
                    return Vec::new();
                };
                self.world
                    .chat_members(room)
                    .into_iter()
                    .filter(|member| !(without_self && *member == origin.id))
                    .collect()
            }
            BroadcastScope::Party(variant) => self.roster(origin, GroupKind::Party, variant),
            BroadcastScope::Guild(variant) => self.roster(origin, GroupKind::Guild, variant),
            BroadcastScope::Battleground(variant) => {
                self.roster(origin, GroupKind::Battleground, variant)
            }
            BroadcastScope::Clan => self.roster(origin, GroupKind::Clan, RosterVariant::All),
            BroadcastScope::Duel { without_self } => {
                let variant = if without_self {
                    RosterVariant::WithoutSelf
                } else {
                    RosterVariant::All
                };
                self.roster(origin, GroupKind::Duel, variant)
            }
        }
    }

    fn area(&self, origin: &Entity, radius: u16, flags: AreaFlags) -> Vec<EntityId> {
        let origin_room = self.world.chat_room_of(origin.id);
        self.world
            .players_in_area(origin.position, radius)
            .into_iter()
            .filter(|viewer| {
                if flags.without_self && *viewer == origin.id {
                    return false;
                }
                let room = self.world.chat_room_of(*viewer);
                if flags.without_chatting && room.is_some() {
                    return false;
                }
                !(flags.without_same_chat && origin_room.is_some() && room == origin_room)
            })
            .collect()
    }

    fn roster(&self, origin: &Entity, kind: GroupKind, variant: RosterVariant) -> Vec<EntityId> {
        let Some(group) = self.world.group_of(origin.id, kind) else {
            return Vec::new();
        };
        self.world
            .roster(group)
            .into_iter()
            .filter(|id| {
                let Some(member) = self.world.entity(*id) else {
                    return false;
                };
                if variant.excludes_self() && *id == origin.id {
                    return false;
                }
                match variant {
                    RosterVariant::All | RosterVariant::WithoutSelf => true,
                    RosterVariant::SameMap | RosterVariant::SameMapWithoutSelf => {
                        member.position.same_map(origin.position)
                    }
                    RosterVariant::Area | RosterVariant::AreaWithoutSelf => origin
                        .position
                        .within(member.position, self.settings.area_size),
                    RosterVariant::NoBattleground => self
                        .world
                        .group_of(*id, GroupKind::Battleground)
                        .is_none(),
                }
            })
            .collect()
    }
}
