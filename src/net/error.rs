use thiserror::Error;

use crate::net::schema::{Epoch, Opcode};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LengthError {
    #[error("opcode {opcode:#06x} has no layout in epoch {epoch}")]
    NotInEpoch { opcode: Opcode, epoch: Epoch },

    #[error("variable frame {opcode:#06x} needs its declared length")]
    MissingDeclared { opcode: Opcode },

    #[error("declared length {declared} below minimum {minimum}")]
    TooShort { declared: u16, minimum: u16 },

    #[error("declared length {declared} above maximum {maximum}")]
    TooLong { declared: u16, maximum: u16 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame opcode {found:#06x} does not match schema {expected:#06x}")]
    OpcodeMismatch { expected: Opcode, found: Opcode },

    #[error("opcode {opcode:#06x} has no layout in epoch {epoch}")]
    NotInEpoch { opcode: Opcode, epoch: Epoch },

    #[error("frame of {len} bytes is shorter than its layout ({needed} bytes)")]
    Truncated { len: usize, needed: usize },

    #[error("field '{field}' is not part of the layout")]
    UnknownField { field: String },

    #[error("field '{field}' is {actual}, read as {requested}")]
    KindMismatch {
        field: String,
        actual: String,
        requested: &'static str,
    },

    #[error("field '{field}' holds an invalid value")]
    InvalidValue { field: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("opcode {0:#06x} is not registered")]
    UnknownOpcode(Opcode),

    #[error("opcode {opcode:#06x} has no layout in epoch {epoch}")]
    NotInEpoch { opcode: Opcode, epoch: Epoch },

    #[error("field '{field}' is not part of the layout")]
    UnknownField { field: String },

    #[error("field '{field}' is {actual}, written as {requested}")]
    KindMismatch {
        field: String,
        actual: String,
        requested: &'static str,
    },

    #[error("write of {len} bytes at offset {offset} overflows a {limit} byte frame")]
    Overflow {
        offset: usize,
        len: usize,
        limit: usize,
    },

    #[error("value for '{field}' does not fit its field")]
    ValueTooLarge { field: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("read {path}: {message}")]
    Io { path: String, message: String },

    #[error("parse packet db: {0}")]
    Parse(String),

    #[error("invalid opcode '{0}'")]
    InvalidOpcode(String),

    #[error("opcode {0:#06x} is reserved for administrative requests")]
    ReservedOpcode(Opcode),

    #[error("opcode {0:#06x} registered twice")]
    DuplicateOpcode(Opcode),

    #[error("opcode {0:#06x} has no layouts")]
    NoLayouts(Opcode),

    #[error("opcode {opcode:#06x} field '{field}' has unknown kind '{kind}'")]
    UnknownKind {
        opcode: Opcode,
        field: String,
        kind: String,
    },

    #[error("opcode {opcode:#06x} layout since {since}: {reason}")]
    Layout {
        opcode: Opcode,
        since: Epoch,
        reason: String,
    },
}

/// Failure reported by a game-logic handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The frame is dropped; the connection stays open.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("decode: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode: {0}")]
    Encode(#[from] EncodeError),

    /// The connection is closed.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Fatal(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown opcode {opcode:#06x}")]
    UnknownOpcode { opcode: Opcode },

    #[error("malformed length for {opcode:#06x}: {source}")]
    MalformedLength {
        opcode: Opcode,
        #[source]
        source: LengthError,
    },

    #[error("schema mismatch for {opcode:#06x} in epoch {epoch}: {source}")]
    SchemaEpochMismatch {
        opcode: Opcode,
        epoch: Epoch,
        #[source]
        source: DecodeError,
    },

    #[error("handler for {opcode:#06x} failed: {source}")]
    Handler {
        opcode: Opcode,
        #[source]
        source: HandlerError,
    },

    #[error("opcode {opcode:#06x} requires an authenticated session")]
    AuthRequired { opcode: Opcode },
}

impl ProtocolError {
    /// Whether the dispatcher closes the connection for this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProtocolError::UnknownOpcode { .. } | ProtocolError::MalformedLength { .. } => true,
            ProtocolError::Handler { source, .. } => source.is_fatal(),
            ProtocolError::SchemaEpochMismatch { .. } | ProtocolError::AuthRequired { .. } => {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_follows_taxonomy() {
        assert!(ProtocolError::UnknownOpcode { opcode: 0x1234 }.is_fatal());
        assert!(ProtocolError::MalformedLength {
            opcode: 0x008c,
            source: LengthError::TooShort {
                declared: 2,
                minimum: 4
            },
        }
        .is_fatal());
        assert!(!ProtocolError::AuthRequired { opcode: 0x0085 }.is_fatal());
        assert!(!ProtocolError::Handler {
            opcode: 0x0085,
            source: HandlerError::Rejected("blocked cell".to_string()),
        }
        .is_fatal());
        assert!(ProtocolError::Handler {
            opcode: 0x0072,
            source: HandlerError::Fatal("bad login key".to_string()),
        }
        .is_fatal());
    }

    #[test]
    fn messages_render_hex_opcodes() {
        let err = ProtocolError::UnknownOpcode { opcode: 0x0abc };
        assert_eq!(err.to_string(), "unknown opcode 0x0abc");
    }
}
