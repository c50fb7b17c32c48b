use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type Opcode = u16;

/// Bytes taken by the opcode at the start of every frame.
pub const OPCODE_LEN: usize = 2;
/// Opcode plus the declared length of a variable frame.
pub const VARIABLE_HEADER_LEN: usize = 4;

/// Client generation tag, usually the client build date (`20040705`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(pub u32);

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketShape {
    /// Total frame length including the opcode.
    Fixed(u16),
    /// Opcode, then a u16 length that counts the whole frame.
    Variable,
}

impl PacketShape {
    pub fn header_len(self) -> usize {
        match self {
            PacketShape::Fixed(_) => OPCODE_LEN,
            PacketShape::Variable => VARIABLE_HEADER_LEN,
        }
    }

    pub fn is_variable(self) -> bool {
        matches!(self, PacketShape::Variable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    I16,
    I32,
    /// Packed map cell: 10 bits x, 10 bits y, 4 bits direction.
    Pos,
    /// Raw bytes of a fixed width.
    Bytes(u16),
    /// NUL padded text of a fixed width.
    Str(u16),
    /// Everything up to the end of a variable frame.
    Tail,
}

impl FieldKind {
    /// Bytes occupied in the frame. `Tail` reports zero, its minimum.
    pub fn width(self) -> usize {
        match self {
            FieldKind::U8 => 1,
            FieldKind::U16 | FieldKind::I16 => 2,
            FieldKind::Pos => 3,
            FieldKind::U32 | FieldKind::I32 => 4,
            FieldKind::U64 => 8,
            FieldKind::Bytes(n) | FieldKind::Str(n) => n as usize,
            FieldKind::Tail => 0,
        }
    }

    /// Parses the packet db spelling: `u16`, `pos`, `str:24`, `bytes:16`, `tail`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim().to_ascii_lowercase();
        if let Some((head, width)) = text.split_once(':') {
            let width: u16 = width.trim().parse().ok()?;
            if width == 0 {
                return None;
            }
            return match head.trim() {
                "bytes" => Some(FieldKind::Bytes(width)),
                "str" => Some(FieldKind::Str(width)),
                _ => None,
            };
        }
        Some(match text.as_str() {
            "u8" => FieldKind::U8,
            "u16" => FieldKind::U16,
            "u32" => FieldKind::U32,
            "u64" => FieldKind::U64,
            "i16" => FieldKind::I16,
            "i32" => FieldKind::I32,
            "pos" => FieldKind::Pos,
            "tail" => FieldKind::Tail,
            _ => return None,
        })
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::U8 => write!(f, "u8"),
            FieldKind::U16 => write!(f, "u16"),
            FieldKind::U32 => write!(f, "u32"),
            FieldKind::U64 => write!(f, "u64"),
            FieldKind::I16 => write!(f, "i16"),
            FieldKind::I32 => write!(f, "i32"),
            FieldKind::Pos => write!(f, "pos"),
            FieldKind::Bytes(n) => write!(f, "bytes:{n}"),
            FieldKind::Str(n) => write!(f, "str:{n}"),
            FieldKind::Tail => write!(f, "tail"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub offset: u16,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn end(&self) -> usize {
        self.offset as usize + self.kind.width()
    }
}

/// Frame layout valid from `since` until the next layout of the same opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub since: Epoch,
    pub shape: PacketShape,
    pub fields: Vec<FieldSpec>,
}

impl Layout {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Smallest frame that still holds every declared field.
    pub fn min_len(&self) -> usize {
        let body_end = self.fields.iter().map(FieldSpec::end).max().unwrap_or(0);
        match self.shape {
            PacketShape::Fixed(n) => n as usize,
            PacketShape::Variable => body_end.max(VARIABLE_HEADER_LEN),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketSchema {
    pub opcode: Opcode,
    pub name: String,
    /// Name of the game-logic handler registered for inbound frames.
    pub handler: Option<String>,
    /// Accepted before the session is bound to an entity.
    pub pre_auth: bool,
    pub layouts: BTreeMap<Epoch, Layout>,
}

impl PacketSchema {
    /// Latest layout introduced at or before `epoch`.
    pub fn layout(&self, epoch: Epoch) -> Option<&Layout> {
        self.layouts
            .range(..=epoch)
            .next_back()
            .map(|(_, layout)| layout)
    }

    pub fn exists_in(&self, epoch: Epoch) -> bool {
        self.layout(epoch).is_some()
    }

    pub fn shape(&self, epoch: Epoch) -> Option<PacketShape> {
        self.layout(epoch).map(|layout| layout.shape)
    }
}
