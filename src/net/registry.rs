use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use log::debug;
use serde::Deserialize;

use crate::net::error::{LengthError, RegistryError};
use crate::net::schema::{
    Epoch, FieldKind, FieldSpec, Layout, Opcode, PacketSchema, PacketShape, VARIABLE_HEADER_LEN,
};

/// Lowest opcode of the administrative range handled by the dispatcher itself.
pub const ADMIN_OPCODE_BASE: Opcode = 0x7530;
pub const DEFAULT_MAX_VARIABLE_LENGTH: u16 = 32768;

#[derive(Debug, Deserialize)]
struct RawPacketDb {
    #[serde(default)]
    packets: Vec<RawPacket>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOpcode {
    Number(u32),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawPacket {
    opcode: RawOpcode,
    name: String,
    #[serde(default)]
    handler: Option<String>,
    #[serde(default)]
    pre_auth: bool,
    #[serde(default)]
    layouts: Vec<RawLayout>,
}

#[derive(Debug, Deserialize)]
struct RawLayout {
    #[serde(default)]
    since: u32,
    length: i32,
    #[serde(default)]
    fields: Vec<RawField>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    name: String,
    offset: u16,
    kind: String,
}

/// Frame counts of one epoch, as printed by `mapwire check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSummary {
    pub epoch: Epoch,
    pub fixed: usize,
    pub variable: usize,
    pub pre_auth: usize,
}

/// Opcode table for every supported client generation. Read-only once built.
#[derive(Debug, Clone)]
pub struct PacketRegistry {
    schemas: BTreeMap<Opcode, PacketSchema>,
    max_variable_length: u16,
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_VARIABLE_LENGTH)
    }
}

impl PacketRegistry {
    pub fn new(max_variable_length: u16) -> Self {
        Self {
            schemas: BTreeMap::new(),
            max_variable_length: max_variable_length.max(VARIABLE_HEADER_LEN as u16),
        }
    }

    pub fn load(path: &Path, max_variable_length: u16) -> Result<Self, RegistryError> {
        let text = std::fs::read_to_string(path).map_err(|err| RegistryError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        let registry = Self::from_yaml_str(&text, max_variable_length)?;
        debug!(
            "packet db {}: {} opcodes",
            path.display(),
            registry.schemas.len()
        );
        Ok(registry)
    }

    pub fn from_yaml_str(text: &str, max_variable_length: u16) -> Result<Self, RegistryError> {
        let raw: RawPacketDb =
            serde_yaml::from_str(text).map_err(|err| RegistryError::Parse(err.to_string()))?;
        let mut registry = Self::new(max_variable_length);
        for packet in raw.packets {
            let schema = convert_packet(packet)?;
            registry.insert(schema)?;
        }
        Ok(registry)
    }

    /// Validates and adds one schema.
    pub fn insert(&mut self, schema: PacketSchema) -> Result<(), RegistryError> {
        if schema.opcode >= ADMIN_OPCODE_BASE {
            return Err(RegistryError::ReservedOpcode(schema.opcode));
        }
        if self.schemas.contains_key(&schema.opcode) {
            return Err(RegistryError::DuplicateOpcode(schema.opcode));
        }
        if schema.layouts.is_empty() {
            return Err(RegistryError::NoLayouts(schema.opcode));
        }
        for layout in schema.layouts.values() {
            validate_layout(schema.opcode, layout, self.max_variable_length)?;
        }
        self.schemas.insert(schema.opcode, schema);
        Ok(())
    }

    pub fn lookup(&self, opcode: Opcode) -> Option<&PacketSchema> {
        self.schemas.get(&opcode)
    }

    /// Schema and layout of `opcode` as seen by clients of `epoch`.
    pub fn lookup_in(&self, opcode: Opcode, epoch: Epoch) -> Option<(&PacketSchema, &Layout)> {
        let schema = self.schemas.get(&opcode)?;
        let layout = schema.layout(epoch)?;
        Some((schema, layout))
    }

    pub fn max_variable_length(&self) -> u16 {
        self.max_variable_length
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PacketSchema> {
        self.schemas.values()
    }

    /// Every epoch at which some layout changes, ascending.
    pub fn epochs(&self) -> Vec<Epoch> {
        let epochs: BTreeSet<Epoch> = self
            .schemas
            .values()
            .flat_map(|schema| schema.layouts.keys().copied())
            .collect();
        epochs.into_iter().collect()
    }

    pub fn summary(&self, epoch: Epoch) -> EpochSummary {
        let mut summary = EpochSummary {
            epoch,
            fixed: 0,
            variable: 0,
            pre_auth: 0,
        };
        for schema in self.schemas.values() {
            let Some(layout) = schema.layout(epoch) else {
                continue;
            };
            match layout.shape {
                PacketShape::Fixed(_) => summary.fixed += 1,
                PacketShape::Variable => summary.variable += 1,
            }
            if schema.pre_auth {
                summary.pre_auth += 1;
            }
        }
        summary
    }

    /// Total length of the frame that starts with `schema`'s opcode.
    ///
    /// Variable frames need the declared length read from offset 2; it is
    /// bounded by the layout's minimum and the configured maximum.
    pub fn frame_length(
        &self,
        schema: &PacketSchema,
        epoch: Epoch,
        declared: Option<u16>,
    ) -> Result<u16, LengthError> {
        let layout = schema.layout(epoch).ok_or(LengthError::NotInEpoch {
            opcode: schema.opcode,
            epoch,
        })?;
        match layout.shape {
            PacketShape::Fixed(n) => Ok(n),
            PacketShape::Variable => {
                let declared = declared.ok_or(LengthError::MissingDeclared {
                    opcode: schema.opcode,
                })?;
                let minimum = layout.min_len() as u16;
                if declared < minimum {
                    return Err(LengthError::TooShort { declared, minimum });
                }
                if declared > self.max_variable_length {
                    return Err(LengthError::TooLong {
                        declared,
                        maximum: self.max_variable_length,
                    });
                }
                Ok(declared)
            }
        }
    }
}

fn parse_opcode(raw: &RawOpcode) -> Result<Opcode, RegistryError> {
    let value = match raw {
        RawOpcode::Number(value) => *value,
        RawOpcode::Text(text) => {
            let trimmed = text.trim();
            let parsed = match trimmed
                .strip_prefix("0x")
                .or_else(|| trimmed.strip_prefix("0X"))
            {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => trimmed.parse::<u32>(),
            };
            parsed.map_err(|_| RegistryError::InvalidOpcode(text.clone()))?
        }
    };
    Opcode::try_from(value).map_err(|_| RegistryError::InvalidOpcode(value.to_string()))
}

fn convert_packet(raw: RawPacket) -> Result<PacketSchema, RegistryError> {
    let opcode = parse_opcode(&raw.opcode)?;
    let mut layouts = BTreeMap::new();
    for raw_layout in raw.layouts {
        let since = Epoch(raw_layout.since);
        let shape = match raw_layout.length {
            -1 => PacketShape::Variable,
            n if (2..=i32::from(u16::MAX)).contains(&n) => PacketShape::Fixed(n as u16),
            n => {
                return Err(RegistryError::Layout {
                    opcode,
                    since,
                    reason: format!("length {n} is neither -1 nor a frame size"),
                })
            }
        };
        let mut fields = Vec::with_capacity(raw_layout.fields.len());
        for field in raw_layout.fields {
            let kind = FieldKind::parse(&field.kind).ok_or_else(|| RegistryError::UnknownKind {
                opcode,
                field: field.name.clone(),
                kind: field.kind.clone(),
            })?;
            fields.push(FieldSpec {
                name: field.name,
                offset: field.offset,
                kind,
            });
        }
        let layout = Layout {
            since,
            shape,
            fields,
        };
        if layouts.insert(since, layout).is_some() {
            return Err(RegistryError::Layout {
                opcode,
                since,
                reason: "declared twice".to_string(),
            });
        }
    }
    Ok(PacketSchema {
        opcode,
        name: raw.name,
        handler: raw.handler.filter(|name| !name.trim().is_empty()),
        pre_auth: raw.pre_auth,
        layouts,
    })
}

fn validate_layout(opcode: Opcode, layout: &Layout, max_variable: u16) -> Result<(), RegistryError> {
    let fail = |reason: String| RegistryError::Layout {
        opcode,
        since: layout.since,
        reason,
    };
    if let PacketShape::Fixed(n) = layout.shape {
        if (n as usize) < layout.shape.header_len() {
            return Err(fail(format!("fixed length {n} cannot hold the opcode")));
        }
    }
    let header = layout.shape.header_len();
    let mut previous_end = header;
    let mut names = BTreeSet::new();
    for (index, field) in layout.fields.iter().enumerate() {
        if !names.insert(field.name.as_str()) {
            return Err(fail(format!("field '{}' declared twice", field.name)));
        }
        let offset = field.offset as usize;
        if offset < previous_end {
            return Err(fail(format!(
                "field '{}' at {} overlaps the previous field or header (ends at {})",
                field.name, offset, previous_end
            )));
        }
        if field.kind == FieldKind::Tail {
            if !layout.shape.is_variable() {
                return Err(fail(format!("tail field '{}' in a fixed frame", field.name)));
            }
            if index + 1 != layout.fields.len() {
                return Err(fail(format!("tail field '{}' is not last", field.name)));
            }
        }
        if let PacketShape::Fixed(n) = layout.shape {
            if field.end() > n as usize {
                return Err(fail(format!(
                    "field '{}' ends at {} past frame length {}",
                    field.name,
                    field.end(),
                    n
                )));
            }
        }
        previous_end = field.end();
    }
    if layout.shape.is_variable() && layout.min_len() > max_variable as usize {
        return Err(fail(format!(
            "minimum length {} exceeds the variable frame limit {}",
            layout.min_len(),
            max_variable
        )));
    }
    Ok(())
}
