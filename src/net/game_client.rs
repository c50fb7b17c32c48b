use log::{debug, info};

use crate::net::broadcast::{AreaFlags, BroadcastScope};
use crate::net::codec::FieldView;
use crate::net::dispatch::{HandlerContext, HandlerResult, HandlerTable};
use crate::net::error::{DecodeError, HandlerError};
use crate::net::game::{
    write_account_ack, write_auth_ok, write_auth_refused, write_changed_dir, write_clear_unit,
    write_fix_pos, write_quit_ack, write_self_chat, write_server_tick, write_unit_chat, ClearType,
};
use crate::net::visibility::VisibilityPolicy;
use crate::world::entity::{Entity, EntityId};
use crate::world::index::{WorldIndex, WorldView};
use crate::world::position::{Direction, MapId, Position};

/// Refusal code sent when the character is already online elsewhere.
pub const REFUSE_ALREADY_ONLINE: u8 = 8;
pub const QUIT_OK: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub account_id: u32,
    pub char_id: u32,
    pub login_id1: u32,
    pub client_tick: u32,
    pub sex: u8,
}

impl ConnectRequest {
    pub fn parse(view: &FieldView<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            account_id: view.u32("account_id")?,
            char_id: view.u32("char_id")?,
            login_id1: view.u32("login_id1")?,
            client_tick: view.u32("client_tick")?,
            sex: view.u8("sex")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkRequest {
    pub x: u16,
    pub y: u16,
}

impl WalkRequest {
    pub fn parse(view: &FieldView<'_>) -> Result<Self, DecodeError> {
        let (x, y, _) = view.pos("dest")?;
        Ok(Self { x, y })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnRequest {
    pub head_dir: u16,
    pub dir: Direction,
}

impl TurnRequest {
    pub fn parse(view: &FieldView<'_>) -> Result<Self, DecodeError> {
        let head_dir = view.u16("head_dir")?;
        let dir = Direction::from_u8(view.u8("dir")?).ok_or_else(|| DecodeError::InvalidValue {
            field: "dir".to_string(),
        })?;
        Ok(Self { head_dir, dir })
    }
}

/// Decides whether a connect request may enter the world and where.
/// `Err` carries the refusal code sent back to the client.
pub trait AccountGate {
    fn admit(&mut self, request: &ConnectRequest) -> Result<Entity, u8>;
}

impl<F> AccountGate for F
where
    F: FnMut(&ConnectRequest) -> Result<Entity, u8>,
{
    fn admit(&mut self, request: &ConnectRequest) -> Result<Entity, u8> {
        self(request)
    }
}

/// Admits every account as a player at a fixed spawn cell.
#[derive(Debug, Clone, Copy)]
pub struct OpenGate {
    pub spawn: Position,
}

impl OpenGate {
    pub fn new(map: MapId, x: u16, y: u16) -> Self {
        Self {
            spawn: Position::new(map, x, y),
        }
    }
}

impl AccountGate for OpenGate {
    fn admit(&mut self, request: &ConnectRequest) -> Result<Entity, u8> {
        let id = i32::try_from(request.account_id).map_err(|_| 1u8)?;
        if id <= 0 {
            return Err(1);
        }
        Ok(Entity::pc(id, self.spawn))
    }
}

/// Registers the map server's core handlers under the names the packet db
/// uses.
pub fn register_core_handlers<G>(table: &mut HandlerTable<WorldIndex>, mut gate: G)
where
    G: AccountGate + 'static,
{
    table.register("want_to_connection", move |ctx, view| {
        want_to_connection(&mut gate, ctx, view)
    });
    table.register("tick_send", tick_send);
    table.register("walk_to_xy", walk_to_xy);
    table.register("global_message", global_message);
    table.register("change_dir", change_dir);
    table.register("quit_game", quit_game);
}

fn want_to_connection<G: AccountGate>(
    gate: &mut G,
    ctx: &mut HandlerContext<'_, WorldIndex>,
    view: &FieldView<'_>,
) -> HandlerResult {
    let request = ConnectRequest::parse(view)?;
    if let Some(bound) = ctx.entity_id() {
        return Err(HandlerError::Rejected(format!(
            "connection already bound to {bound}"
        )));
    }
    ctx.reply(&write_account_ack(EntityId(request.account_id as i32)));

    let entity = match gate.admit(&request) {
        Ok(entity) => entity,
        Err(reason) => return refuse(ctx, request.account_id, reason),
    };
    if let Err(err) = ctx.bind(entity.id) {
        debug!("connect {}: {}", ctx.connection, err);
        return refuse(ctx, request.account_id, REFUSE_ALREADY_ONLINE);
    }
    let position = entity.position;
    info!(
        "account {} entered map {} at {},{} (epoch {})",
        request.account_id, position.map, position.x, position.y, ctx.epoch
    );
    ctx.world.insert(entity);
    let frame = write_auth_ok(ctx.registry, ctx.epoch, ctx.tick, position, Direction::North)?;
    ctx.reply(&frame);
    Ok(())
}

fn refuse(ctx: &mut HandlerContext<'_, WorldIndex>, account: u32, reason: u8) -> HandlerResult {
    info!("account {} refused with code {}", account, reason);
    let frame = write_auth_refused(ctx.registry, ctx.epoch, reason)?;
    ctx.reply(&frame);
    ctx.wait_close();
    Ok(())
}

fn tick_send(ctx: &mut HandlerContext<'_, WorldIndex>, view: &FieldView<'_>) -> HandlerResult {
    let client_tick = view.u32("client_tick")?;
    debug!("session {} client tick {}", ctx.connection, client_tick);
    let frame = write_server_tick(ctx.registry, ctx.epoch, ctx.tick)?;
    ctx.reply(&frame);
    Ok(())
}

fn walk_to_xy(ctx: &mut HandlerContext<'_, WorldIndex>, view: &FieldView<'_>) -> HandlerResult {
    let request = WalkRequest::parse(view)?;
    let origin = ctx.origin()?;
    let target = Position::new(origin.position.map, request.x, request.y);
    if target == origin.position {
        return Ok(());
    }
    ctx.world.move_to(origin.id, target);
    let origin = ctx.origin()?;
    let registry = ctx.registry;
    ctx.deliver_with(
        &origin,
        BroadcastScope::Area(AreaFlags::NONE),
        VisibilityPolicy::Everyone,
        |frame| write_fix_pos(registry, frame, target),
    )?;
    Ok(())
}

fn global_message(ctx: &mut HandlerContext<'_, WorldIndex>, view: &FieldView<'_>) -> HandlerResult {
    let message = view.str("message")?;
    let origin = ctx.origin()?;
    let scope = if ctx.world.chat_room_of(origin.id).is_some() {
        BroadcastScope::Chat {
            room: None,
            without_self: true,
        }
    } else {
        BroadcastScope::AreaChat
    };
    let registry = ctx.registry;
    ctx.deliver_with(&origin, scope, VisibilityPolicy::Everyone, |frame| {
        write_unit_chat(registry, frame, &message)
    })?;
    let echo = write_self_chat(registry, ctx.epoch, &message)?;
    ctx.reply(&echo);
    Ok(())
}

fn change_dir(ctx: &mut HandlerContext<'_, WorldIndex>, view: &FieldView<'_>) -> HandlerResult {
    let request = TurnRequest::parse(view)?;
    let origin = ctx.origin()?;
    // A disguised unit must see its own shadow turn too.
    let flags = if origin.is_disguised() {
        AreaFlags::NONE
    } else {
        AreaFlags::WITHOUT_SELF
    };
    let registry = ctx.registry;
    ctx.deliver_with(
        &origin,
        BroadcastScope::Area(flags),
        VisibilityPolicy::Everyone,
        |frame| write_changed_dir(registry, frame, request.head_dir, request.dir),
    )?;
    Ok(())
}

fn quit_game(ctx: &mut HandlerContext<'_, WorldIndex>, view: &FieldView<'_>) -> HandlerResult {
    let kind = view.u16("kind")?;
    let origin = ctx.origin()?;
    debug!("entity {} quits (kind {})", origin.id, kind);
    let ack = write_quit_ack(ctx.registry, ctx.epoch, QUIT_OK)?;
    ctx.reply(&ack);
    let registry = ctx.registry;
    let clear = ClearType::LoggedOut;
    ctx.deliver_with(&origin, clear.scope(), VisibilityPolicy::Everyone, |frame| {
        write_clear_unit(registry, frame, clear)
    })?;
    ctx.world.remove(origin.id);
    ctx.wait_close();
    Ok(())
}
