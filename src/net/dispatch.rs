use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use lru::LruCache;
use thiserror::Error;

use crate::net::broadcast::{
    BroadcastScope, DeliveryReport, FrameContext, Resolver, ResolverSettings,
};
use crate::net::codec::FieldView;
use crate::net::error::{EncodeError, HandlerError, ProtocolError};
use crate::net::game::{
    write_version_reply, ServerVersion, OPCODE_ADMIN_DISCONNECT, OPCODE_VERSION_QUERY,
};
use crate::net::registry::{PacketRegistry, ADMIN_OPCODE_BASE};
use crate::net::schema::{Epoch, Opcode, OPCODE_LEN};
use crate::net::session::{ConnectionId, FrameState, Session, SessionError, SessionTable};
use crate::net::visibility::VisibilityPolicy;
use crate::telemetry::trace::{hex_dump, Direction, PacketTrace};
use crate::world::entity::{Entity, EntityId};
use crate::world::index::WorldView;

pub type HandlerResult = Result<(), HandlerError>;

pub type Handler<W> = Box<dyn FnMut(&mut HandlerContext<'_, W>, &FieldView<'_>) -> HandlerResult>;

/// What a handler may touch while processing one frame.
pub struct HandlerContext<'a, W: WorldView> {
    pub world: &'a mut W,
    pub sessions: &'a mut SessionTable,
    pub registry: &'a PacketRegistry,
    pub connection: ConnectionId,
    pub epoch: Epoch,
    /// Milliseconds since the dispatcher started.
    pub tick: u32,
    resolver: ResolverSettings,
}

impl<'a, W: WorldView> HandlerContext<'a, W> {
    pub fn entity_id(&self) -> Option<EntityId> {
        self.sessions
            .get(self.connection)
            .and_then(|session| session.entity())
    }

    /// Snapshot of the entity bound to this connection.
    pub fn origin(&self) -> Result<Entity, HandlerError> {
        let id = self
            .entity_id()
            .ok_or_else(|| HandlerError::Rejected("no entity bound".to_string()))?;
        self.world
            .entity(id)
            .cloned()
            .ok_or_else(|| HandlerError::Rejected(format!("entity {id} is not in the world")))
    }

    pub fn bind(&mut self, entity: EntityId) -> Result<(), SessionError> {
        self.sessions.attach(self.connection, entity)
    }

    /// Queues raw bytes for this connection only.
    pub fn reply(&mut self, frame: &[u8]) -> bool {
        self.sessions
            .get_mut(self.connection)
            .map(|session| session.send(frame))
            .unwrap_or(false)
    }

    /// Stops dispatching this connection's frames until the I/O side drops it.
    pub fn wait_close(&mut self) {
        if let Some(session) = self.sessions.get_mut(self.connection) {
            session.set_wait_close(true);
        }
    }

    pub fn close(&mut self, reason: &str) {
        if let Some(session) = self.sessions.get_mut(self.connection) {
            session.close(reason);
        }
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        self.resolver
    }

    pub fn deliver(
        &mut self,
        origin: &Entity,
        scope: BroadcastScope,
        policy: VisibilityPolicy,
        frame: &[u8],
    ) -> DeliveryReport {
        Resolver::new(&*self.world, self.resolver).deliver(self.sessions, origin, scope, policy, frame)
    }

    pub fn deliver_with<F>(
        &mut self,
        origin: &Entity,
        scope: BroadcastScope,
        policy: VisibilityPolicy,
        builder: F,
    ) -> Result<DeliveryReport, EncodeError>
    where
        F: FnMut(FrameContext) -> Result<Option<Vec<u8>>, EncodeError>,
    {
        Resolver::new(&*self.world, self.resolver).deliver_with(
            self.sessions,
            origin,
            scope,
            policy,
            builder,
        )
    }
}

/// Handlers keyed by the name the packet db gives them.
pub struct HandlerTable<W: WorldView> {
    handlers: HashMap<String, Handler<W>>,
    fallback: Option<Handler<W>>,
}

impl<W: WorldView> Default for HandlerTable<W> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: None,
        }
    }
}

impl<W: WorldView> HandlerTable<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: FnMut(&mut HandlerContext<'_, W>, &FieldView<'_>) -> HandlerResult + 'static,
    {
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    /// Runs for frames whose schema names no registered handler.
    pub fn set_fallback<F>(&mut self, handler: F)
    where
        F: FnMut(&mut HandlerContext<'_, W>, &FieldView<'_>) -> HandlerResult + 'static,
    {
        self.fallback = Some(Box::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn resolve(&mut self, name: Option<&str>) -> Option<&mut Handler<W>> {
        match name.and_then(|name| self.handlers.get_mut(name)) {
            Some(handler) => Some(handler),
            None => self.fallback.as_mut(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OffenseWindow {
    window_start: Instant,
    offenses: usize,
}

/// Per-connection count of frames sent before authentication.
#[derive(Debug)]
pub struct OffenseTable {
    windows: LruCache<ConnectionId, OffenseWindow>,
    window: Duration,
    limit: usize,
}

impl OffenseTable {
    pub fn new(capacity: usize, limit: usize, window: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            windows: LruCache::new(capacity),
            window,
            limit,
        }
    }

    /// Counts one offense. True once the connection went over the limit
    /// inside the current window.
    pub fn record(&mut self, connection: ConnectionId, now: Instant) -> bool {
        if let Some(entry) = self.windows.get_mut(&connection) {
            if now.duration_since(entry.window_start) >= self.window {
                entry.window_start = now;
                entry.offenses = 0;
            }
            entry.offenses += 1;
            return entry.offenses > self.limit;
        }
        self.windows.put(
            connection,
            OffenseWindow {
                window_start: now,
                offenses: 1,
            },
        );
        1 > self.limit
    }

    pub fn forget(&mut self, connection: ConnectionId) {
        self.windows.pop(&connection);
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    /// Complete frames processed per connection per loop turn.
    pub frames_per_turn: usize,
    pub auth_offense_limit: usize,
    pub auth_offense_window: Duration,
    pub offense_table_capacity: usize,
    pub resolver: ResolverSettings,
    pub version: ServerVersion,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            frames_per_turn: 8,
            auth_offense_limit: 5,
            auth_offense_window: Duration::from_millis(10_000),
            offense_table_capacity: 1024,
            resolver: ResolverSettings::default(),
            version: ServerVersion::default(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("too many frames before authentication")]
    AuthFlood,

    #[error("administrative disconnect request")]
    AdminRequest,

    #[error("closed by handler")]
    Handler,

    #[error("connection is not open")]
    Gone,
}

/// Why a pump returned control to the I/O loop.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PumpEnd {
    /// The inbound buffer holds no complete frame.
    #[default]
    Starved,
    /// The per-turn frame cap was reached with frames still buffered.
    Yielded,
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PumpReport {
    /// Complete frames taken off the inbound buffer.
    pub frames: usize,
    /// Frames a handler (or the admin path) processed successfully.
    pub dispatched: usize,
    /// Frames consumed without a handler.
    pub skipped: usize,
    /// Frames whose handler failed or panicked.
    pub dropped: usize,
    /// Frames refused for lack of authentication.
    pub unauthorized: usize,
    pub end: PumpEnd,
}

enum Framing {
    Incomplete(FrameState),
    VersionQuery,
    AdminDisconnect,
    Ready { opcode: Opcode, len: usize },
    Fatal(ProtocolError),
}

/// Frames inbound bytes and runs handlers, one connection at a time.
pub struct Dispatcher {
    registry: Arc<PacketRegistry>,
    settings: DispatchSettings,
    offenses: OffenseTable,
    trace: Option<PacketTrace>,
    started: Instant,
}

impl Dispatcher {
    pub fn new(registry: Arc<PacketRegistry>, settings: DispatchSettings) -> Self {
        let offenses = OffenseTable::new(
            settings.offense_table_capacity,
            settings.auth_offense_limit,
            settings.auth_offense_window,
        );
        Self {
            registry,
            settings,
            offenses,
            trace: None,
            started: Instant::now(),
        }
    }

    pub fn with_trace(mut self, trace: Option<PacketTrace>) -> Self {
        self.trace = trace;
        self
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn tick(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    /// Drains a connection's outbound queue for the socket.
    pub fn flush(&mut self, sessions: &mut SessionTable, connection: ConnectionId) -> Vec<u8> {
        let Some(session) = sessions.get_mut(connection) else {
            return Vec::new();
        };
        let bytes = session.take_outbound();
        if let Some(trace) = self.trace.as_mut() {
            if !bytes.is_empty() {
                trace.record(connection, session.epoch(), Direction::Outbound, &bytes);
            }
        }
        bytes
    }

    /// One loop turn: pumps every open connection once, in id order.
    pub fn turn<W: WorldView>(
        &mut self,
        sessions: &mut SessionTable,
        world: &mut W,
        handlers: &mut HandlerTable<W>,
    ) -> Vec<(ConnectionId, PumpReport)> {
        let mut reports = Vec::new();
        for connection in sessions.ids() {
            let open = sessions
                .get(connection)
                .map(|session| !session.is_closed())
                .unwrap_or(false);
            if open {
                reports.push((connection, self.pump(sessions, connection, world, handlers)));
            }
        }
        reports
    }

    /// Processes up to `frames_per_turn` complete frames buffered for
    /// `connection`. Each frame is consumed whole, only after its handler
    /// returned.
    pub fn pump<W: WorldView>(
        &mut self,
        sessions: &mut SessionTable,
        connection: ConnectionId,
        world: &mut W,
        handlers: &mut HandlerTable<W>,
    ) -> PumpReport {
        let registry = Arc::clone(&self.registry);
        let mut report = PumpReport::default();
        loop {
            let Some(session) = sessions
                .get_mut(connection)
                .filter(|session| !session.is_closed())
            else {
                report.end = PumpEnd::Closed(CloseReason::Gone);
                return report;
            };
            if report.frames >= self.settings.frames_per_turn {
                report.end = PumpEnd::Yielded;
                return report;
            }

            let (opcode, len) = match next_frame(&registry, session) {
                Framing::Incomplete(state) => {
                    session.set_state(state);
                    report.end = PumpEnd::Starved;
                    return report;
                }
                Framing::Fatal(err) => {
                    debug!(
                        "session {}: {}, buffered bytes:\n{}",
                        connection,
                        err,
                        hex_dump(session.inbound().as_slice())
                    );
                    report.end = self.close(sessions, connection, CloseReason::Protocol(err));
                    return report;
                }
                Framing::VersionQuery => {
                    report.frames += 1;
                    session.send(&write_version_reply(&self.settings.version));
                    session.inbound_mut().consume(OPCODE_LEN);
                    session.set_state(FrameState::AwaitingHeader);
                    report.dispatched += 1;
                    continue;
                }
                Framing::AdminDisconnect => {
                    report.frames += 1;
                    report.end = self.close(sessions, connection, CloseReason::AdminRequest);
                    return report;
                }
                Framing::Ready { opcode, len } => (opcode, len),
            };

            report.frames += 1;
            let frame = match session.inbound().peek(len) {
                Some(bytes) => bytes.to_vec(),
                None => {
                    report.end = PumpEnd::Starved;
                    return report;
                }
            };
            let epoch = session.epoch();
            if let Some(trace) = self.trace.as_mut() {
                trace.record(connection, epoch, Direction::Inbound, &frame);
            }

            if session.is_waiting_disconnect() {
                consume(session, len);
                report.skipped += 1;
                continue;
            }

            let Some((schema, _)) = registry.lookup_in(opcode, epoch) else {
                report.end = self.close(
                    sessions,
                    connection,
                    CloseReason::Protocol(ProtocolError::UnknownOpcode { opcode }),
                );
                return report;
            };

            if !session.is_authenticated() && !schema.pre_auth {
                consume(session, len);
                report.unauthorized += 1;
                debug!(
                    "session {}: {}",
                    connection,
                    ProtocolError::AuthRequired { opcode }
                );
                if self.offenses.record(connection, Instant::now()) {
                    report.end = self.close(sessions, connection, CloseReason::AuthFlood);
                    return report;
                }
                continue;
            }

            let Some(handler) = handlers.resolve(schema.handler.as_deref()) else {
                debug!(
                    "session {}: no handler for {:#06x} ({}), {} bytes\n{}",
                    connection,
                    opcode,
                    schema.name,
                    len,
                    hex_dump(&frame)
                );
                consume(session, len);
                report.skipped += 1;
                continue;
            };

            let view = match FieldView::parse(schema, epoch, &frame) {
                Ok(view) => view,
                Err(source) => {
                    warn!(
                        "session {}: {}",
                        connection,
                        ProtocolError::SchemaEpochMismatch {
                            opcode,
                            epoch,
                            source
                        }
                    );
                    consume(session, len);
                    report.dropped += 1;
                    continue;
                }
            };

            let tick = self.tick();
            let mut ctx = HandlerContext {
                world: &mut *world,
                sessions: &mut *sessions,
                registry: &registry,
                connection,
                epoch,
                tick,
                resolver: self.settings.resolver,
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut ctx, &view)));

            let Some(session) = sessions
                .get_mut(connection)
                .filter(|session| !session.is_closed())
            else {
                if matches!(outcome, Ok(Ok(()))) {
                    report.dispatched += 1;
                }
                self.offenses.forget(connection);
                report.end = PumpEnd::Closed(CloseReason::Handler);
                return report;
            };
            consume(session, len);

            match outcome {
                Ok(Ok(())) => report.dispatched += 1,
                Ok(Err(HandlerError::Decode(source))) => {
                    warn!(
                        "session {}: {}",
                        connection,
                        ProtocolError::SchemaEpochMismatch {
                            opcode,
                            epoch,
                            source
                        }
                    );
                    report.dropped += 1;
                }
                Ok(Err(source)) if source.is_fatal() => {
                    let err = ProtocolError::Handler { opcode, source };
                    info!("session {}: {}", connection, err);
                    report.end = self.close(sessions, connection, CloseReason::Protocol(err));
                    return report;
                }
                Ok(Err(source)) => {
                    debug!(
                        "session {}: {}",
                        connection,
                        ProtocolError::Handler { opcode, source }
                    );
                    report.dropped += 1;
                }
                Err(_) => {
                    error!(
                        "session {}: handler for {:#06x} ({}) panicked, frame dropped",
                        connection, opcode, schema.name
                    );
                    report.dropped += 1;
                }
            }
        }
    }

    fn close(
        &mut self,
        sessions: &mut SessionTable,
        connection: ConnectionId,
        reason: CloseReason,
    ) -> PumpEnd {
        if let Some(session) = sessions.get_mut(connection) {
            session.close(reason.to_string());
        }
        self.offenses.forget(connection);
        info!("session {} closed: {}", connection, reason);
        PumpEnd::Closed(reason)
    }
}

fn consume(session: &mut Session, len: usize) {
    session.inbound_mut().consume(len);
    session.set_state(FrameState::AwaitingHeader);
}

/// Decides what the bytes at the head of the inbound buffer are, without
/// consuming anything.
fn next_frame(registry: &PacketRegistry, session: &Session) -> Framing {
    let queue = session.inbound();
    let Some(opcode) = queue.peek_u16_le(0) else {
        return Framing::Incomplete(FrameState::AwaitingHeader);
    };
    if opcode >= ADMIN_OPCODE_BASE {
        return match opcode {
            OPCODE_VERSION_QUERY => Framing::VersionQuery,
            OPCODE_ADMIN_DISCONNECT => Framing::AdminDisconnect,
            _ => Framing::Fatal(ProtocolError::UnknownOpcode { opcode }),
        };
    }
    let epoch = session.epoch();
    let Some((schema, layout)) = registry.lookup_in(opcode, epoch) else {
        return Framing::Fatal(ProtocolError::UnknownOpcode { opcode });
    };
    let declared = if layout.shape.is_variable() {
        match queue.peek_u16_le(OPCODE_LEN) {
            Some(declared) => Some(declared),
            None => {
                return Framing::Incomplete(FrameState::AwaitingBody {
                    opcode,
                    needed: None,
                })
            }
        }
    } else {
        None
    };
    let len = match registry.frame_length(schema, epoch, declared) {
        Ok(len) => len,
        Err(source) => return Framing::Fatal(ProtocolError::MalformedLength { opcode, source }),
    };
    if queue.available() < len as usize {
        return Framing::Incomplete(FrameState::AwaitingBody {
            opcode,
            needed: Some(len),
        });
    }
    Framing::Ready {
        opcode,
        len: len as usize,
    }
}
