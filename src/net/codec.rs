use std::fmt;

use crate::net::error::{DecodeError, EncodeError};
use crate::net::packet::{pack_position, read_u16_le, read_u32_le, read_u64_le, read_u8, unpack_position};
use crate::net::registry::PacketRegistry;
use crate::net::schema::{
    Epoch, FieldKind, FieldSpec, Layout, Opcode, PacketSchema, PacketShape, OPCODE_LEN,
    VARIABLE_HEADER_LEN,
};

/// Where a `put_*` call writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot<'a> {
    /// A field declared by the layout for the builder's epoch.
    Field(&'a str),
    /// A raw byte offset.
    At(usize),
    /// Right after the previous write.
    Next,
}

impl<'a> From<&'a str> for Slot<'a> {
    fn from(name: &'a str) -> Self {
        Slot::Field(name)
    }
}

impl From<usize> for Slot<'_> {
    fn from(offset: usize) -> Self {
        Slot::At(offset)
    }
}

/// Builds one outbound frame into a buffer it owns.
///
/// Fixed frames start zero-filled at their full length. Variable frames grow
/// as payload is written and get their length patched in by `finish`.
#[derive(Debug)]
pub struct FrameBuilder<'r> {
    schema: &'r PacketSchema,
    layout: &'r Layout,
    epoch: Epoch,
    buf: Vec<u8>,
    cursor: usize,
    limit: usize,
}

impl<'r> FrameBuilder<'r> {
    pub fn begin(
        registry: &'r PacketRegistry,
        opcode: Opcode,
        epoch: Epoch,
    ) -> Result<Self, EncodeError> {
        Self::begin_optional(registry, opcode, epoch)?
            .ok_or(EncodeError::NotInEpoch { opcode, epoch })
    }

    /// Like `begin`, but `Ok(None)` when the message does not exist for
    /// clients of `epoch` and must be skipped.
    pub fn begin_optional(
        registry: &'r PacketRegistry,
        opcode: Opcode,
        epoch: Epoch,
    ) -> Result<Option<Self>, EncodeError> {
        let schema = registry
            .lookup(opcode)
            .ok_or(EncodeError::UnknownOpcode(opcode))?;
        let Some(layout) = schema.layout(epoch) else {
            return Ok(None);
        };
        let (buf, limit) = match layout.shape {
            PacketShape::Fixed(n) => (vec![0u8; n as usize], n as usize),
            PacketShape::Variable => (
                vec![0u8; VARIABLE_HEADER_LEN],
                registry.max_variable_length() as usize,
            ),
        };
        let mut builder = Self {
            schema,
            layout,
            epoch,
            buf,
            cursor: layout.shape.header_len(),
            limit,
        };
        builder.buf[..OPCODE_LEN].copy_from_slice(&opcode.to_le_bytes());
        Ok(Some(builder))
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn layout(&self) -> &Layout {
        self.layout
    }

    /// Bytes written so far, including the header.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8<'s>(&mut self, slot: impl Into<Slot<'s>>, value: u8) -> Result<&mut Self, EncodeError> {
        let offset = self.resolve(slot.into(), "u8", |kind| kind == FieldKind::U8)?;
        self.write_at(offset, &[value])
    }

    pub fn put_u16<'s>(&mut self, slot: impl Into<Slot<'s>>, value: u16) -> Result<&mut Self, EncodeError> {
        let offset = self.resolve(slot.into(), "u16", |kind| kind == FieldKind::U16)?;
        self.write_at(offset, &value.to_le_bytes())
    }

    pub fn put_u32<'s>(&mut self, slot: impl Into<Slot<'s>>, value: u32) -> Result<&mut Self, EncodeError> {
        let offset = self.resolve(slot.into(), "u32", |kind| kind == FieldKind::U32)?;
        self.write_at(offset, &value.to_le_bytes())
    }

    pub fn put_u64<'s>(&mut self, slot: impl Into<Slot<'s>>, value: u64) -> Result<&mut Self, EncodeError> {
        let offset = self.resolve(slot.into(), "u64", |kind| kind == FieldKind::U64)?;
        self.write_at(offset, &value.to_le_bytes())
    }

    pub fn put_i16<'s>(&mut self, slot: impl Into<Slot<'s>>, value: i16) -> Result<&mut Self, EncodeError> {
        let offset = self.resolve(slot.into(), "i16", |kind| kind == FieldKind::I16)?;
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Entity ids travel as signed 32-bit values so shadow ids stay negative.
    pub fn put_i32<'s>(&mut self, slot: impl Into<Slot<'s>>, value: i32) -> Result<&mut Self, EncodeError> {
        let offset = self.resolve(slot.into(), "i32", |kind| {
            kind == FieldKind::I32 || kind == FieldKind::U32
        })?;
        self.write_at(offset, &value.to_le_bytes())
    }

    pub fn put_pos<'s>(
        &mut self,
        slot: impl Into<Slot<'s>>,
        x: u16,
        y: u16,
        dir: u8,
    ) -> Result<&mut Self, EncodeError> {
        let slot = slot.into();
        let offset = self.resolve(slot, "pos", |kind| kind == FieldKind::Pos)?;
        if x > 0x3ff || y > 0x3ff || dir > 0x0f {
            return Err(EncodeError::ValueTooLarge {
                field: slot_name(slot),
            });
        }
        self.write_at(offset, &pack_position(x, y, dir))
    }

    /// Fixed-width fields are padded with zeros; longer input is an error.
    pub fn put_bytes<'s>(&mut self, slot: impl Into<Slot<'s>>, value: &[u8]) -> Result<&mut Self, EncodeError> {
        let slot = slot.into();
        let width = self.slot_width(slot, "bytes", |kind| {
            matches!(kind, FieldKind::Bytes(_) | FieldKind::Tail)
        })?;
        let offset = self.offset_of(slot)?;
        match width {
            Some(width) => {
                if value.len() > width {
                    return Err(EncodeError::ValueTooLarge {
                        field: slot_name(slot),
                    });
                }
                let mut padded = vec![0u8; width];
                padded[..value.len()].copy_from_slice(value);
                self.write_at(offset, &padded)
            }
            None => self.write_at(offset, value),
        }
    }

    /// Text fields always keep a terminating NUL. Fixed-width text is cut to
    /// fit; tail text is written in full.
    pub fn put_str<'s>(&mut self, slot: impl Into<Slot<'s>>, value: &str) -> Result<&mut Self, EncodeError> {
        let slot = slot.into();
        let width = self.slot_width(slot, "str", |kind| {
            matches!(kind, FieldKind::Str(_) | FieldKind::Tail)
        })?;
        let offset = self.offset_of(slot)?;
        let bytes = value.as_bytes();
        match width {
            Some(width) => {
                let keep = bytes.len().min(width.saturating_sub(1));
                let mut padded = vec![0u8; width];
                padded[..keep].copy_from_slice(&bytes[..keep]);
                self.write_at(offset, &padded)
            }
            None => {
                let mut terminated = Vec::with_capacity(bytes.len() + 1);
                terminated.extend_from_slice(bytes);
                terminated.push(0);
                self.write_at(offset, &terminated)
            }
        }
    }

    /// Returns the owned frame. Variable frames get their total length
    /// written at offset 2.
    pub fn finish(mut self) -> Result<Vec<u8>, EncodeError> {
        if self.layout.shape.is_variable() {
            let min = self.layout.min_len();
            if self.buf.len() < min {
                self.buf.resize(min, 0);
            }
            let total = self.buf.len();
            if total > self.limit {
                return Err(EncodeError::Overflow {
                    offset: 0,
                    len: total,
                    limit: self.limit,
                });
            }
            let len = total as u16;
            self.buf[OPCODE_LEN..VARIABLE_HEADER_LEN].copy_from_slice(&len.to_le_bytes());
        }
        Ok(self.buf)
    }

    fn field(&self, name: &str) -> Result<&'r FieldSpec, EncodeError> {
        self.layout
            .field(name)
            .ok_or_else(|| EncodeError::UnknownField {
                field: name.to_string(),
            })
    }

    fn offset_of(&self, slot: Slot<'_>) -> Result<usize, EncodeError> {
        match slot {
            Slot::Field(name) => Ok(self.field(name)?.offset as usize),
            Slot::At(offset) => Ok(offset),
            Slot::Next => Ok(self.cursor),
        }
    }

    fn resolve(
        &self,
        slot: Slot<'_>,
        requested: &'static str,
        accepts: impl Fn(FieldKind) -> bool,
    ) -> Result<usize, EncodeError> {
        if let Slot::Field(name) = slot {
            let field = self.field(name)?;
            if !accepts(field.kind) {
                return Err(EncodeError::KindMismatch {
                    field: name.to_string(),
                    actual: field.kind.to_string(),
                    requested,
                });
            }
        }
        self.offset_of(slot)
    }

    /// Declared width of a named field; `None` for tails and raw slots.
    fn slot_width(
        &self,
        slot: Slot<'_>,
        requested: &'static str,
        accepts: impl Fn(FieldKind) -> bool,
    ) -> Result<Option<usize>, EncodeError> {
        self.resolve(slot, requested, &accepts)?;
        match slot {
            Slot::Field(name) => {
                let kind = self.field(name)?.kind;
                Ok(match kind {
                    FieldKind::Tail => None,
                    other => Some(other.width()),
                })
            }
            Slot::At(_) | Slot::Next => Ok(None),
        }
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<&mut Self, EncodeError> {
        let overflow = EncodeError::Overflow {
            offset,
            len: bytes.len(),
            limit: self.limit,
        };
        let Some(end) = offset.checked_add(bytes.len()) else {
            return Err(overflow);
        };
        if offset < OPCODE_LEN || end > self.limit {
            return Err(overflow);
        }
        if self.layout.shape.is_variable() && offset < VARIABLE_HEADER_LEN {
            return Err(overflow);
        }
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[offset..end].copy_from_slice(bytes);
        self.cursor = end;
        Ok(self)
    }
}

fn slot_name(slot: Slot<'_>) -> String {
    match slot {
        Slot::Field(name) => name.to_string(),
        Slot::At(offset) => format!("@{offset}"),
        Slot::Next => "@next".to_string(),
    }
}

/// Decoded value of one field, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Unsigned(u64),
    Signed(i64),
    Pos { x: u16, y: u16, dir: u8 },
    Bytes(Vec<u8>),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Unsigned(value) => write!(f, "{value}"),
            FieldValue::Signed(value) => write!(f, "{value}"),
            FieldValue::Pos { x, y, dir } => write!(f, "({x},{y}) dir {dir}"),
            FieldValue::Bytes(bytes) => {
                for (idx, byte) in bytes.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            FieldValue::Text(text) => write!(f, "{text:?}"),
        }
    }
}

/// Typed, epoch-aware view over one complete inbound frame.
#[derive(Debug, Clone, Copy)]
pub struct FieldView<'a> {
    schema: &'a PacketSchema,
    layout: &'a Layout,
    epoch: Epoch,
    bytes: &'a [u8],
}

/// Accessor misuse is a bug in the caller, not in the client's bytes.
fn misuse(err: DecodeError) -> DecodeError {
    debug_assert!(false, "frame accessor misuse: {err}");
    err
}

impl<'a> FieldView<'a> {
    pub fn parse(
        schema: &'a PacketSchema,
        epoch: Epoch,
        bytes: &'a [u8],
    ) -> Result<Self, DecodeError> {
        let layout = schema.layout(epoch).ok_or_else(|| {
            misuse(DecodeError::NotInEpoch {
                opcode: schema.opcode,
                epoch,
            })
        })?;
        let needed = layout.min_len();
        if bytes.len() < needed {
            return Err(misuse(DecodeError::Truncated {
                len: bytes.len(),
                needed,
            }));
        }
        let found = read_u16_le(bytes, 0).unwrap_or_default();
        if found != schema.opcode {
            return Err(misuse(DecodeError::OpcodeMismatch {
                expected: schema.opcode,
                found,
            }));
        }
        Ok(Self {
            schema,
            layout,
            epoch,
            bytes,
        })
    }

    pub fn opcode(&self) -> Opcode {
        self.schema.opcode
    }

    pub fn schema(&self) -> &'a PacketSchema {
        self.schema
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Whether this epoch's layout declares `name`.
    pub fn has(&self, name: &str) -> bool {
        self.layout.field(name).is_some()
    }

    pub fn u8(&self, name: &str) -> Result<u8, DecodeError> {
        let field = self.expect(name, "u8", |kind| kind == FieldKind::U8)?;
        self.read(field, |data, offset| read_u8(data, offset))
    }

    pub fn u16(&self, name: &str) -> Result<u16, DecodeError> {
        let field = self.expect(name, "u16", |kind| kind == FieldKind::U16)?;
        self.read(field, read_u16_le)
    }

    pub fn u32(&self, name: &str) -> Result<u32, DecodeError> {
        let field = self.expect(name, "u32", |kind| kind == FieldKind::U32)?;
        self.read(field, read_u32_le)
    }

    pub fn u64(&self, name: &str) -> Result<u64, DecodeError> {
        let field = self.expect(name, "u64", |kind| kind == FieldKind::U64)?;
        self.read(field, read_u64_le)
    }

    pub fn i16(&self, name: &str) -> Result<i16, DecodeError> {
        let field = self.expect(name, "i16", |kind| kind == FieldKind::I16)?;
        self.read(field, read_u16_le).map(|value| value as i16)
    }

    pub fn i32(&self, name: &str) -> Result<i32, DecodeError> {
        let field = self.expect(name, "i32", |kind| {
            kind == FieldKind::I32 || kind == FieldKind::U32
        })?;
        self.read(field, read_u32_le).map(|value| value as i32)
    }

    pub fn pos(&self, name: &str) -> Result<(u16, u16, u8), DecodeError> {
        let field = self.expect(name, "pos", |kind| kind == FieldKind::Pos)?;
        let raw = self.slice(field)?;
        Ok(unpack_position([raw[0], raw[1], raw[2]]))
    }

    /// Raw bytes of a fixed-width or tail field.
    pub fn raw(&self, name: &str) -> Result<&'a [u8], DecodeError> {
        let field = self.expect(name, "bytes", |kind| {
            matches!(kind, FieldKind::Bytes(_) | FieldKind::Str(_) | FieldKind::Tail)
        })?;
        self.slice(field)
    }

    /// Text up to the first NUL, invalid UTF-8 replaced.
    pub fn str(&self, name: &str) -> Result<String, DecodeError> {
        let field = self.expect(name, "str", |kind| {
            matches!(kind, FieldKind::Str(_) | FieldKind::Tail)
        })?;
        let raw = self.slice(field)?;
        let end = raw.iter().position(|byte| *byte == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    pub fn value(&self, field: &FieldSpec) -> Result<FieldValue, DecodeError> {
        let name = field.name.as_str();
        Ok(match field.kind {
            FieldKind::U8 => FieldValue::Unsigned(self.u8(name)? as u64),
            FieldKind::U16 => FieldValue::Unsigned(self.u16(name)? as u64),
            FieldKind::U32 => FieldValue::Unsigned(self.u32(name)? as u64),
            FieldKind::U64 => FieldValue::Unsigned(self.u64(name)?),
            FieldKind::I16 => FieldValue::Signed(self.i16(name)? as i64),
            FieldKind::I32 => FieldValue::Signed(self.i32(name)? as i64),
            FieldKind::Pos => {
                let (x, y, dir) = self.pos(name)?;
                FieldValue::Pos { x, y, dir }
            }
            FieldKind::Bytes(_) => FieldValue::Bytes(self.raw(name)?.to_vec()),
            FieldKind::Str(_) | FieldKind::Tail => FieldValue::Text(self.str(name)?),
        })
    }

    /// Every declared field with its decoded value, in layout order.
    pub fn values(&self) -> Result<Vec<(&'a str, FieldValue)>, DecodeError> {
        self.layout
            .fields
            .iter()
            .map(|field| Ok((field.name.as_str(), self.value(field)?)))
            .collect()
    }

    fn expect(
        &self,
        name: &str,
        requested: &'static str,
        accepts: impl Fn(FieldKind) -> bool,
    ) -> Result<&'a FieldSpec, DecodeError> {
        let field = self.layout.field(name).ok_or_else(|| {
            misuse(DecodeError::UnknownField {
                field: name.to_string(),
            })
        })?;
        if !accepts(field.kind) {
            return Err(misuse(DecodeError::KindMismatch {
                field: name.to_string(),
                actual: field.kind.to_string(),
                requested,
            }));
        }
        Ok(field)
    }

    fn slice(&self, field: &FieldSpec) -> Result<&'a [u8], DecodeError> {
        let start = field.offset as usize;
        let end = match field.kind {
            FieldKind::Tail => self.bytes.len(),
            _ => field.end(),
        };
        self.bytes.get(start..end).ok_or_else(|| {
            misuse(DecodeError::Truncated {
                len: self.bytes.len(),
                needed: end,
            })
        })
    }

    fn read<T>(
        &self,
        field: &FieldSpec,
        reader: impl Fn(&[u8], usize) -> Option<T>,
    ) -> Result<T, DecodeError> {
        reader(self.bytes, field.offset as usize).ok_or_else(|| {
            misuse(DecodeError::Truncated {
                len: self.bytes.len(),
                needed: field.end(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB: &str = r#"
packets:
  - opcode: "0x0088"
    name: FixPos
    layouts:
      - length: 10
        fields:
          - { name: id, offset: 2, kind: i32 }
          - { name: x, offset: 6, kind: u16 }
          - { name: y, offset: 8, kind: u16 }
  - opcode: "0x008d"
    name: UnitChat
    layouts:
      - length: -1
        fields:
          - { name: id, offset: 4, kind: i32 }
          - { name: message, offset: 8, kind: tail }
  - opcode: "0x0085"
    name: WalkToXy
    layouts:
      - length: 5
        fields:
          - { name: dest, offset: 2, kind: pos }
      - since: 20040705
        length: 8
        fields:
          - { name: dest, offset: 5, kind: pos }
  - opcode: "0x0095"
    name: NameAck
    layouts:
      - length: 30
        fields:
          - { name: id, offset: 2, kind: u32 }
          - { name: name, offset: 6, kind: "str:24" }
"#;

    fn registry(max: u16) -> PacketRegistry {
        PacketRegistry::from_yaml_str(DB, max).expect("db")
    }

    #[test]
    fn fix_pos_wire_bytes() {
        let registry = registry(32768);
        let mut frame = FrameBuilder::begin(&registry, 0x0088, Epoch(0)).expect("begin");
        frame
            .put_i32("id", 1001)
            .and_then(|frame| frame.put_u16("x", 53))
            .and_then(|frame| frame.put_u16("y", 112))
            .expect("fields");
        let bytes = frame.finish().expect("finish");
        assert_eq!(
            bytes,
            vec![0x88, 0x00, 0xE9, 0x03, 0x00, 0x00, 0x35, 0x00, 0x70, 0x00]
        );
    }

    #[test]
    fn fixed_frames_keep_their_length_and_read_back() {
        let registry = registry(32768);
        let mut frame = FrameBuilder::begin(&registry, 0x0095, Epoch(0)).expect("begin");
        frame.put_u32("id", 150_000).expect("id");
        frame.put_str("name", "Poring").expect("name");
        let bytes = frame.finish().expect("finish");
        assert_eq!(bytes.len(), 30);
        let schema = registry.lookup(0x0095).expect("schema");
        let view = FieldView::parse(schema, Epoch(0), &bytes).expect("view");
        assert_eq!(view.u32("id"), Ok(150_000));
        assert_eq!(view.str("name").as_deref(), Ok("Poring"));
    }

    #[test]
    fn fixed_text_is_truncated_with_terminator() {
        let registry = registry(32768);
        let mut frame = FrameBuilder::begin(&registry, 0x0095, Epoch(0)).expect("begin");
        frame.put_str("name", &"x".repeat(40)).expect("name");
        let bytes = frame.finish().expect("finish");
        assert_eq!(bytes[6 + 23], 0);
        assert_eq!(bytes[6 + 22], b'x');
    }

    #[test]
    fn variable_length_is_patched_on_finish() {
        let registry = registry(32768);
        for payload in [0usize, 1, 300] {
            let text = "a".repeat(payload);
            let mut frame = FrameBuilder::begin(&registry, 0x008d, Epoch(0)).expect("begin");
            frame.put_i32("id", -7).expect("id");
            frame.put_str("message", &text).expect("message");
            let bytes = frame.finish().expect("finish");
            let total = 8 + payload + 1;
            assert_eq!(bytes.len(), total);
            assert_eq!(read_u16_le(&bytes, 2), Some(total as u16));
            let schema = registry.lookup(0x008d).expect("schema");
            let view = FieldView::parse(schema, Epoch(0), &bytes).expect("view");
            assert_eq!(view.i32("id"), Ok(-7));
            assert_eq!(view.str("message"), Ok(text));
        }
    }

    #[test]
    fn variable_frame_at_and_above_limit() {
        let registry = registry(64);
        let schema = registry.lookup(0x008d).expect("schema");

        let mut frame = FrameBuilder::begin(&registry, 0x008d, Epoch(0)).expect("begin");
        frame.put_bytes("message", &[0x41; 56]).expect("fits");
        let bytes = frame.finish().expect("finish");
        assert_eq!(bytes.len(), 64);
        let view = FieldView::parse(schema, Epoch(0), &bytes).expect("view");
        assert_eq!(view.raw("message").map(<[u8]>::len), Ok(56));

        let mut frame = FrameBuilder::begin(&registry, 0x008d, Epoch(0)).expect("begin");
        let err = frame.put_bytes("message", &[0x41; 57]).expect_err("too long");
        assert!(matches!(err, EncodeError::Overflow { limit: 64, .. }));
    }

    #[test]
    fn write_past_address_space_is_an_overflow() {
        let registry = registry(32768);
        let mut frame = FrameBuilder::begin(&registry, 0x008d, Epoch(0)).expect("begin");
        let err = frame
            .put_u32(Slot::At(usize::MAX - 1), 7)
            .expect_err("wraps");
        assert_eq!(
            err,
            EncodeError::Overflow {
                offset: usize::MAX - 1,
                len: 4,
                limit: 32768,
            }
        );
        let err = frame
            .put_bytes(Slot::At(usize::MAX), &[1, 2])
            .expect_err("wraps");
        assert!(matches!(err, EncodeError::Overflow { len: 2, .. }));
        frame.put_i32("id", 3).expect("builder still usable");
    }

    #[test]
    fn next_slot_appends_after_previous_write() {
        let registry = registry(32768);
        let mut frame = FrameBuilder::begin(&registry, 0x008d, Epoch(0)).expect("begin");
        frame.put_i32("id", 1).expect("id");
        frame.put_u16(Slot::Next, 0xbeef).expect("next");
        frame.put_u8(Slot::Next, 0x01).expect("next");
        let bytes = frame.finish().expect("finish");
        assert_eq!(&bytes[8..], &[0xef, 0xbe, 0x01]);
    }

    #[test]
    fn epoch_specific_offsets() {
        let registry = registry(32768);
        let old = {
            let mut frame = FrameBuilder::begin(&registry, 0x0085, Epoch(0)).expect("begin");
            frame.put_pos("dest", 53, 112, 0).expect("dest");
            frame.finish().expect("finish")
        };
        let new = {
            let mut frame =
                FrameBuilder::begin(&registry, 0x0085, Epoch(20040705)).expect("begin");
            frame.put_pos("dest", 53, 112, 0).expect("dest");
            frame.finish().expect("finish")
        };
        assert_eq!(old.len(), 5);
        assert_eq!(new.len(), 8);
        assert_eq!(&old[2..5], &new[5..8]);
        let schema = registry.lookup(0x0085).expect("schema");
        let view = FieldView::parse(schema, Epoch(20040705), &new).expect("view");
        assert_eq!(view.pos("dest"), Ok((53, 112, 0)));
    }

    #[test]
    fn writer_rejects_mismatched_kinds_and_unknown_fields() {
        let registry = registry(32768);
        let mut frame = FrameBuilder::begin(&registry, 0x0088, Epoch(0)).expect("begin");
        assert!(matches!(
            frame.put_u8("x", 1),
            Err(EncodeError::KindMismatch { .. })
        ));
        assert!(matches!(
            frame.put_u16("z", 1),
            Err(EncodeError::UnknownField { .. })
        ));
        assert!(matches!(
            frame.put_u16(Slot::At(9), 1),
            Err(EncodeError::Overflow { .. })
        ));
        assert_eq!(
            FrameBuilder::begin(&registry, 0x0099, Epoch(0)).map(|_| ()),
            Err(EncodeError::UnknownOpcode(0x0099))
        );
    }

    #[test]
    fn optional_begin_skips_missing_epochs() {
        let db = r#"
packets:
  - opcode: "0x01d7"
    name: LookChange
    layouts:
      - since: 20040000
        length: 11
"#;
        let registry = PacketRegistry::from_yaml_str(db, 32768).expect("db");
        assert!(FrameBuilder::begin_optional(&registry, 0x01d7, Epoch(20031231))
            .expect("known")
            .is_none());
        assert!(FrameBuilder::begin_optional(&registry, 0x01d7, Epoch(20040000))
            .expect("known")
            .is_some());
    }

    #[test]
    fn values_list_every_field() {
        let registry = registry(32768);
        let bytes = [0x88, 0x00, 0xE9, 0x03, 0x00, 0x00, 0x35, 0x00, 0x70, 0x00];
        let schema = registry.lookup(0x0088).expect("schema");
        let view = FieldView::parse(schema, Epoch(0), &bytes).expect("view");
        let values = view.values().expect("values");
        assert_eq!(
            values,
            vec![
                ("id", FieldValue::Signed(1001)),
                ("x", FieldValue::Unsigned(53)),
                ("y", FieldValue::Unsigned(112)),
            ]
        );
        assert!(view.has("x"));
        assert!(!view.has("dir"));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "frame accessor misuse")]
    fn unknown_field_read_asserts_in_debug() {
        let registry = registry(32768);
        let bytes = [0x88, 0x00, 0xE9, 0x03, 0x00, 0x00, 0x35, 0x00, 0x70, 0x00];
        let schema = registry.lookup(0x0088).expect("schema");
        let view = FieldView::parse(schema, Epoch(0), &bytes).expect("view");
        let _ = view.u16("dir");
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn unknown_field_read_errors_in_release() {
        let registry = registry(32768);
        let bytes = [0x88, 0x00, 0xE9, 0x03, 0x00, 0x00, 0x35, 0x00, 0x70, 0x00];
        let schema = registry.lookup(0x0088).expect("schema");
        let view = FieldView::parse(schema, Epoch(0), &bytes).expect("view");
        assert!(matches!(
            view.u16("dir"),
            Err(DecodeError::UnknownField { .. })
        ));
    }
}
