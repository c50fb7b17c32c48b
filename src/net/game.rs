use serde::Deserialize;

use crate::net::broadcast::{AreaFlags, BroadcastScope, FrameContext};
use crate::net::codec::FrameBuilder;
use crate::net::error::EncodeError;
use crate::net::registry::PacketRegistry;
use crate::net::schema::{Epoch, Opcode};
use crate::world::entity::EntityId;
use crate::world::position::{Direction, Position};

pub const OPCODE_AUTH_OK: Opcode = 0x0073;
pub const OPCODE_SERVER_TICK: Opcode = 0x007f;
pub const OPCODE_CLEAR_UNIT: Opcode = 0x0080;
pub const OPCODE_AUTH_REFUSED: Opcode = 0x0081;
pub const OPCODE_FIX_POS: Opcode = 0x0088;
pub const OPCODE_UNIT_CHAT: Opcode = 0x008d;
pub const OPCODE_SELF_CHAT: Opcode = 0x008e;
pub const OPCODE_CHANGED_DIR: Opcode = 0x009c;
pub const OPCODE_LOOK_CHANGE_LEGACY: Opcode = 0x00c3;
pub const OPCODE_QUIT_ACK: Opcode = 0x018b;
pub const OPCODE_LOOK_CHANGE: Opcode = 0x01d7;

pub const OPCODE_VERSION_QUERY: Opcode = 0x7530;
pub const OPCODE_VERSION_REPLY: Opcode = 0x7531;
pub const OPCODE_ADMIN_DISCONNECT: Opcode = 0x7532;
pub const VERSION_REPLY_LEN: usize = 10;

/// Server type bit reported by the version query.
pub const SERVER_TYPE_MAP: u8 = 8;

/// Visible square sent with the auth reply.
const AUTH_VIEW_SIZE: u8 = 5;

/// Reported by the administrative version query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
    pub release_flag: u8,
    pub official_flag: u8,
    pub server_type: u8,
    pub mod_version: u16,
}

impl Default for ServerVersion {
    fn default() -> Self {
        Self {
            major: 1,
            minor: 0,
            revision: 0,
            release_flag: 1,
            official_flag: 0,
            server_type: SERVER_TYPE_MAP,
            mod_version: 0,
        }
    }
}

/// Why a unit leaves a client's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearType {
    OutOfSight = 0,
    Died = 1,
    LoggedOut = 2,
    Teleported = 3,
}

impl ClearType {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// A death is shown to the dying unit too; every other vanish skips it.
    pub fn scope(self) -> BroadcastScope {
        match self {
            ClearType::Died => BroadcastScope::Area(AreaFlags::NONE),
            _ => BroadcastScope::Area(AreaFlags::WITHOUT_SELF),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookType {
    Base = 0,
    Hair = 1,
    Weapon = 2,
    HeadBottom = 3,
    HeadTop = 4,
    HeadMid = 5,
    HairColor = 6,
    ClothesColor = 7,
    Shield = 8,
    Shoes = 9,
}

impl LookType {
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

pub fn write_fix_pos(
    registry: &PacketRegistry,
    ctx: FrameContext,
    position: Position,
) -> Result<Option<Vec<u8>>, EncodeError> {
    let Some(mut frame) = FrameBuilder::begin_optional(registry, OPCODE_FIX_POS, ctx.epoch)? else {
        return Ok(None);
    };
    frame
        .put_i32("id", ctx.presented_id.wire())?
        .put_u16("x", position.x)?
        .put_u16("y", position.y)?;
    frame.finish().map(Some)
}

pub fn write_clear_unit(
    registry: &PacketRegistry,
    ctx: FrameContext,
    kind: ClearType,
) -> Result<Option<Vec<u8>>, EncodeError> {
    let Some(mut frame) = FrameBuilder::begin_optional(registry, OPCODE_CLEAR_UNIT, ctx.epoch)?
    else {
        return Ok(None);
    };
    frame
        .put_i32("id", ctx.presented_id.wire())?
        .put_u8("kind", kind.to_u8())?;
    frame.finish().map(Some)
}

/// Speech bubble over a unit, seen by everyone around it.
pub fn write_unit_chat(
    registry: &PacketRegistry,
    ctx: FrameContext,
    message: &str,
) -> Result<Option<Vec<u8>>, EncodeError> {
    let Some(mut frame) = FrameBuilder::begin_optional(registry, OPCODE_UNIT_CHAT, ctx.epoch)?
    else {
        return Ok(None);
    };
    frame
        .put_i32("id", ctx.presented_id.wire())?
        .put_str("message", message)?;
    frame.finish().map(Some)
}

/// Echo of the speaker's own message.
pub fn write_self_chat(
    registry: &PacketRegistry,
    epoch: Epoch,
    message: &str,
) -> Result<Vec<u8>, EncodeError> {
    let mut frame = FrameBuilder::begin(registry, OPCODE_SELF_CHAT, epoch)?;
    frame.put_str("message", message)?;
    frame.finish()
}

pub fn write_changed_dir(
    registry: &PacketRegistry,
    ctx: FrameContext,
    head_dir: u16,
    dir: Direction,
) -> Result<Option<Vec<u8>>, EncodeError> {
    let Some(mut frame) = FrameBuilder::begin_optional(registry, OPCODE_CHANGED_DIR, ctx.epoch)?
    else {
        return Ok(None);
    };
    frame
        .put_i32("id", ctx.presented_id.wire())?
        .put_u16("head_dir", head_dir)?
        .put_u8("dir", dir.to_u8())?;
    frame.finish().map(Some)
}

/// Sprite change. Clients that predate the wide form get the one-byte
/// legacy frame, which cannot carry values above 255.
pub fn write_look_change(
    registry: &PacketRegistry,
    ctx: FrameContext,
    look: LookType,
    value: u16,
    value2: u16,
) -> Result<Option<Vec<u8>>, EncodeError> {
    if let Some(mut frame) = FrameBuilder::begin_optional(registry, OPCODE_LOOK_CHANGE, ctx.epoch)? {
        frame
            .put_i32("id", ctx.presented_id.wire())?
            .put_u8("look", look.to_u8())?
            .put_u16("value", value)?
            .put_u16("value2", value2)?;
        return frame.finish().map(Some);
    }
    let Some(mut frame) =
        FrameBuilder::begin_optional(registry, OPCODE_LOOK_CHANGE_LEGACY, ctx.epoch)?
    else {
        return Ok(None);
    };
    let narrow = u8::try_from(value).map_err(|_| EncodeError::ValueTooLarge {
        field: "value".to_string(),
    })?;
    frame
        .put_i32("id", ctx.presented_id.wire())?
        .put_u8("look", look.to_u8())?
        .put_u8("value", narrow)?;
    frame.finish().map(Some)
}

pub fn write_auth_ok(
    registry: &PacketRegistry,
    epoch: Epoch,
    tick: u32,
    position: Position,
    dir: Direction,
) -> Result<Vec<u8>, EncodeError> {
    let mut frame = FrameBuilder::begin(registry, OPCODE_AUTH_OK, epoch)?;
    frame
        .put_u32("tick", tick)?
        .put_pos("pos", position.x, position.y, dir.to_u8())?
        .put_u8("x_size", AUTH_VIEW_SIZE)?
        .put_u8("y_size", AUTH_VIEW_SIZE)?;
    frame.finish()
}

pub fn write_auth_refused(
    registry: &PacketRegistry,
    epoch: Epoch,
    reason: u8,
) -> Result<Vec<u8>, EncodeError> {
    let mut frame = FrameBuilder::begin(registry, OPCODE_AUTH_REFUSED, epoch)?;
    frame.put_u8("reason", reason)?;
    frame.finish()
}

pub fn write_server_tick(
    registry: &PacketRegistry,
    epoch: Epoch,
    tick: u32,
) -> Result<Vec<u8>, EncodeError> {
    let mut frame = FrameBuilder::begin(registry, OPCODE_SERVER_TICK, epoch)?;
    frame.put_u32("tick", tick)?;
    frame.finish()
}

pub fn write_quit_ack(
    registry: &PacketRegistry,
    epoch: Epoch,
    result: u16,
) -> Result<Vec<u8>, EncodeError> {
    let mut frame = FrameBuilder::begin(registry, OPCODE_QUIT_ACK, epoch)?;
    frame.put_u16("result", result)?;
    frame.finish()
}

/// Bare account id written ahead of any framed reply to a connect request.
pub fn write_account_ack(account: EntityId) -> [u8; 4] {
    account.wire().to_le_bytes()
}

/// Reply to the administrative version query. Not part of the packet db.
pub fn write_version_reply(version: &ServerVersion) -> [u8; VERSION_REPLY_LEN] {
    let mut out = [0u8; VERSION_REPLY_LEN];
    out[0..2].copy_from_slice(&OPCODE_VERSION_REPLY.to_le_bytes());
    out[2] = version.major;
    out[3] = version.minor;
    out[4] = version.revision;
    out[5] = version.release_flag;
    out[6] = version.official_flag;
    out[7] = version.server_type;
    out[8..10].copy_from_slice(&version.mod_version.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::FieldView;
    use crate::net::packet::unpack_position;

    const PACKET_DB: &str = include_str!("../../db/packet_db.yml");
    const OLD: Epoch = Epoch(20031231);
    const NEW: Epoch = Epoch(20040705);

    fn registry() -> PacketRegistry {
        PacketRegistry::from_yaml_str(PACKET_DB, 32768).expect("packet db")
    }

    fn ctx(epoch: Epoch, id: i32) -> FrameContext {
        FrameContext {
            epoch,
            presented_id: EntityId(id),
        }
    }

    #[test]
    fn fix_pos_matches_reference_bytes() {
        let registry = registry();
        let frame = write_fix_pos(&registry, ctx(NEW, 1001), Position::new(1, 53, 112))
            .expect("encode")
            .expect("exists");
        assert_eq!(
            frame,
            vec![0x88, 0x00, 0xE9, 0x03, 0x00, 0x00, 0x35, 0x00, 0x70, 0x00]
        );
    }

    #[test]
    fn shadow_id_is_encoded_negated() {
        let registry = registry();
        let frame = write_clear_unit(&registry, ctx(OLD, -1001), ClearType::LoggedOut)
            .expect("encode")
            .expect("exists");
        assert_eq!(frame, vec![0x80, 0x00, 0x17, 0xfc, 0xff, 0xff, 0x02]);
    }

    #[test]
    fn unit_chat_patches_total_length() {
        let registry = registry();
        let frame = write_unit_chat(&registry, ctx(NEW, 7), "Alice : hi")
            .expect("encode")
            .expect("exists");
        assert_eq!(frame.len(), 8 + 10 + 1);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]) as usize, frame.len());
        let schema = registry.lookup(OPCODE_UNIT_CHAT).expect("schema");
        let view = FieldView::parse(schema, NEW, &frame).expect("parse");
        assert_eq!(view.i32("id"), Ok(7));
        assert_eq!(view.str("message").as_deref(), Ok("Alice : hi"));

        let echo = write_self_chat(&registry, NEW, "Alice : hi").expect("echo");
        assert_eq!(&echo[..4], &[0x8e, 0x00, 15, 0x00]);
    }

    #[test]
    fn look_change_falls_back_for_old_clients() {
        let registry = registry();
        let wide = write_look_change(&registry, ctx(NEW, 5), LookType::Weapon, 1201, 2101)
            .expect("encode")
            .expect("exists");
        assert_eq!(wide.len(), 11);
        assert_eq!(&wide[..2], &[0xd7, 0x01]);
        assert_eq!(&wide[6..], &[2, 0xb1, 0x04, 0x35, 0x08]);

        let narrow = write_look_change(&registry, ctx(OLD, 5), LookType::HairColor, 3, 0)
            .expect("encode")
            .expect("exists");
        assert_eq!(narrow, vec![0xc3, 0x00, 5, 0, 0, 0, 6, 3]);

        assert_eq!(
            write_look_change(&registry, ctx(OLD, 5), LookType::Base, 4001, 0),
            Err(EncodeError::ValueTooLarge {
                field: "value".to_string()
            })
        );
    }

    #[test]
    fn auth_frames() {
        let registry = registry();
        let ok = write_auth_ok(&registry, NEW, 0x01020304, Position::new(1, 53, 112), Direction::South)
            .expect("auth ok");
        assert_eq!(ok.len(), 11);
        assert_eq!(&ok[..6], &[0x73, 0x00, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(unpack_position([ok[6], ok[7], ok[8]]), (53, 112, Direction::South.to_u8()));
        assert_eq!(&ok[9..], &[5, 5]);

        assert_eq!(
            write_auth_refused(&registry, OLD, 3).expect("refused"),
            vec![0x81, 0x00, 3]
        );
        assert_eq!(
            write_server_tick(&registry, OLD, 1000).expect("tick"),
            vec![0x7f, 0x00, 0xe8, 0x03, 0x00, 0x00]
        );
        assert_eq!(write_account_ack(EntityId(2000001)), 2000001i32.to_le_bytes());
    }

    #[test]
    fn version_reply_layout() {
        let version = ServerVersion {
            major: 1,
            minor: 2,
            revision: 3,
            release_flag: 1,
            official_flag: 0,
            server_type: SERVER_TYPE_MAP,
            mod_version: 0x1234,
        };
        assert_eq!(
            write_version_reply(&version),
            [0x31, 0x75, 1, 2, 3, 1, 0, 8, 0x34, 0x12]
        );
    }

    #[test]
    fn death_is_shown_to_the_dying_unit() {
        assert_eq!(ClearType::Died.scope(), BroadcastScope::Area(AreaFlags::NONE));
        assert_eq!(
            ClearType::Teleported.scope(),
            BroadcastScope::Area(AreaFlags::WITHOUT_SELF)
        );
    }
}
