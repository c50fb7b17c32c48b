use std::collections::{BTreeMap, HashMap};
use std::fmt;

use log::{debug, info};
use thiserror::Error;

use crate::net::packet::ByteQueue;
use crate::net::schema::{Epoch, Opcode};
use crate::world::entity::EntityId;
use crate::world::index::WorldView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where the dispatcher stands in the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    AwaitingHeader,
    /// Opcode known; `needed` is unknown until a variable frame's length arrives.
    AwaitingBody { opcode: Opcode, needed: Option<u16> },
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("connection {0} is not open")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is already bound to entity {1}")]
    AlreadyBound(ConnectionId, EntityId),

    #[error("entity {entity} is already bound to connection {connection}")]
    EntityInUse {
        entity: EntityId,
        connection: ConnectionId,
    },
}

/// Server-side state of one client connection.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    inbound: ByteQueue,
    outbound: Vec<u8>,
    entity: Option<EntityId>,
    epoch: Epoch,
    state: FrameState,
    waiting_disconnect: bool,
    can_see_hidden: bool,
    close_reason: Option<String>,
}

impl Session {
    pub fn new(id: ConnectionId, epoch: Epoch) -> Self {
        Self {
            id,
            inbound: ByteQueue::new(),
            outbound: Vec::new(),
            entity: None,
            epoch,
            state: FrameState::AwaitingHeader,
            waiting_disconnect: false,
            can_see_hidden: false,
            close_reason: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Fixed when the connection is accepted.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn entity(&self) -> Option<EntityId> {
        self.entity
    }

    pub fn is_authenticated(&self) -> bool {
        self.entity.is_some()
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: FrameState) {
        if self.state != FrameState::Closed {
            self.state = state;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == FrameState::Closed
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// Appends bytes read from the socket. Ignored once closed.
    pub fn receive(&mut self, bytes: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inbound.push(bytes);
        true
    }

    pub fn inbound(&self) -> &ByteQueue {
        &self.inbound
    }

    pub(crate) fn inbound_mut(&mut self) -> &mut ByteQueue {
        &mut self.inbound
    }

    /// Queues one complete frame for the I/O side.
    pub fn send(&mut self, frame: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.extend_from_slice(frame);
        true
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Drains everything queued for the socket.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    /// Drops both buffers. Partial inbound frames and unflushed outbound
    /// frames are lost.
    pub fn close(&mut self, reason: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        let reason = reason.into();
        debug!("session {} closed: {}", self.id, reason);
        self.inbound.clear();
        self.outbound.clear();
        self.state = FrameState::Closed;
        self.close_reason = Some(reason);
    }

    /// Keeps framing inbound bytes but stops handing them to handlers until
    /// the I/O side flushes and drops the connection.
    pub fn set_wait_close(&mut self, waiting: bool) {
        self.waiting_disconnect = waiting;
    }

    pub fn is_waiting_disconnect(&self) -> bool {
        self.waiting_disconnect
    }

    pub fn can_see_hidden(&self) -> bool {
        self.can_see_hidden
    }

    pub fn set_can_see_hidden(&mut self, allowed: bool) {
        self.can_see_hidden = allowed;
    }
}

/// Every open connection, plus the entity binding index the resolver uses.
#[derive(Debug)]
pub struct SessionTable {
    sessions: BTreeMap<ConnectionId, Session>,
    by_entity: HashMap<EntityId, ConnectionId>,
    next_id: u32,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            by_entity: HashMap::new(),
            next_id: 1,
            max_sessions,
        }
    }

    /// Opens a session; `None` when the table is full.
    pub fn accept(&mut self, epoch: Epoch) -> Option<ConnectionId> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }
        let id = ConnectionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.sessions.insert(id, Session::new(id, epoch));
        info!("session {} accepted (epoch {})", id, epoch);
        Some(id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Binds an authenticated entity to the connection.
    pub fn attach(&mut self, id: ConnectionId, entity: EntityId) -> Result<(), SessionError> {
        if let Some(existing) = self.by_entity.get(&entity) {
            if *existing != id {
                return Err(SessionError::EntityInUse {
                    entity,
                    connection: *existing,
                });
            }
        }
        let session = self
            .sessions
            .get_mut(&id)
            .filter(|session| !session.is_closed())
            .ok_or(SessionError::UnknownConnection(id))?;
        match session.entity {
            Some(bound) if bound != entity => return Err(SessionError::AlreadyBound(id, bound)),
            _ => session.entity = Some(entity),
        }
        self.by_entity.insert(entity, id);
        info!("session {} bound to entity {}", id, entity);
        Ok(())
    }

    pub fn session_of(&self, entity: EntityId) -> Option<ConnectionId> {
        self.by_entity.get(&entity).copied()
    }

    /// Open session bound to `entity`, if any.
    pub fn live_session_of(&self, entity: EntityId) -> Option<&Session> {
        let id = self.by_entity.get(&entity)?;
        self.sessions.get(id).filter(|session| !session.is_closed())
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        if let Some(entity) = session.entity {
            if self.by_entity.get(&entity) == Some(&id) {
                self.by_entity.remove(&entity);
            }
        }
        info!("session {} removed", id);
        Some(session)
    }

    /// Removes every closed session and returns their ids.
    pub fn reap_closed(&mut self) -> Vec<ConnectionId> {
        let closed: Vec<ConnectionId> = self
            .sessions
            .values()
            .filter(|session| session.is_closed())
            .map(|session| session.id)
            .collect();
        for id in &closed {
            self.remove(*id);
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Open sessions that completed authentication, in connection order.
    pub fn authenticated(&self) -> impl Iterator<Item = &Session> {
        self.sessions
            .values()
            .filter(|session| session.is_authenticated() && !session.is_closed())
    }

    /// Online user count. With `hide_hidden`, sessions whose entity is
    /// administratively hidden are left out.
    pub fn count_users<W: WorldView + ?Sized>(&self, world: &W, hide_hidden: bool) -> usize {
        self.authenticated()
            .filter(|session| {
                if !hide_hidden {
                    return true;
                }
                session
                    .entity
                    .and_then(|id| world.entity(id))
                    .map(|entity| !entity.hidden)
                    .unwrap_or(true)
            })
            .count()
    }
}
