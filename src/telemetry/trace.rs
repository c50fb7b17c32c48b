use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crate::net::packet::read_u16_le;
use crate::net::schema::Epoch;
use crate::net::session::ConnectionId;

/// `in`, `out` or `all`; `0`, `off` and `false` disable tracing.
pub const TRACE_ENV: &str = "MAPWIRE_PACKET_TRACE";
pub const TRACE_MAX_BYTES: usize = 4096;

static TRACE_SEQ: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn tag(self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

/// Which directions a trace writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceFilter {
    pub inbound: bool,
    pub outbound: bool,
}

impl TraceFilter {
    pub const ALL: TraceFilter = TraceFilter {
        inbound: true,
        outbound: true,
    };

    /// Reads a `MAPWIRE_PACKET_TRACE` value. Unrecognised words trace both
    /// directions.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "off" | "false" | "no" => None,
            "in" => Some(TraceFilter {
                inbound: true,
                outbound: false,
            }),
            "out" => Some(TraceFilter {
                inbound: false,
                outbound: true,
            }),
            _ => Some(TraceFilter::ALL),
        }
    }

    pub fn from_env() -> Option<Self> {
        std::env::var(TRACE_ENV)
            .ok()
            .and_then(|value| TraceFilter::parse(&value))
    }

    fn admits(self, direction: Direction) -> bool {
        match direction {
            Direction::Inbound => self.inbound,
            Direction::Outbound => self.outbound,
        }
    }
}

/// Append-only frame log. Lines carry milliseconds since the trace opened.
#[derive(Debug)]
pub struct PacketTrace {
    file: File,
    filter: TraceFilter,
    opened: Instant,
}

impl PacketTrace {
    /// Opens `dir/<kind>-<pid>-<seq>.trace` when `MAPWIRE_PACKET_TRACE` asks
    /// for it.
    pub fn from_env(dir: &Path, kind: &str) -> Option<Self> {
        let filter = TraceFilter::from_env()?;
        match Self::open(dir, kind, filter) {
            Ok(trace) => Some(trace),
            Err(err) => {
                log::warn!("packet trace disabled: {}", err);
                None
            }
        }
    }

    pub fn open(dir: &Path, kind: &str, filter: TraceFilter) -> Result<Self, String> {
        std::fs::create_dir_all(dir)
            .map_err(|err| format!("create {}: {}", dir.display(), err))?;
        let seq = TRACE_SEQ.fetch_add(1, Ordering::SeqCst);
        let path = dir.join(format!("{kind}-{}-{seq}.trace", std::process::id()));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| format!("open {}: {}", path.display(), err))?;
        writeln!(
            file,
            "# mapwire {kind} trace, in={} out={}",
            filter.inbound, filter.outbound
        )
        .map_err(|err| format!("write {}: {}", path.display(), err))?;
        log::info!("packet trace at {}", path.display());
        Ok(Self {
            file,
            filter,
            opened: Instant::now(),
        })
    }

    /// Outbound batches are logged under the opcode of their first frame.
    pub fn record(
        &mut self,
        connection: ConnectionId,
        epoch: Epoch,
        direction: Direction,
        bytes: &[u8],
    ) {
        if !self.filter.admits(direction) {
            return;
        }
        let elapsed = self.opened.elapsed().as_millis();
        let line = format_line(elapsed, connection, epoch, direction, bytes);
        if let Err(err) = self.file.write_all(line.as_bytes()) {
            log::debug!("packet trace write failed: {}", err);
        }
    }
}

pub fn format_line(
    elapsed_ms: u128,
    connection: ConnectionId,
    epoch: Epoch,
    direction: Direction,
    bytes: &[u8],
) -> String {
    let len = bytes.len();
    let shown = &bytes[..len.min(TRACE_MAX_BYTES)];
    let mut line = String::with_capacity(80 + shown.len() * 2);
    let _ = write!(line, "{elapsed_ms:>8} {connection} {:<3}", direction.tag());
    match read_u16_le(bytes, 0) {
        Some(opcode) => {
            let _ = write!(line, " op={opcode:#06x}");
        }
        None => line.push_str(" op=-"),
    }
    let _ = write!(line, " epoch={epoch} len={len}");
    if len > shown.len() {
        let _ = write!(line, " cut={}", len - shown.len());
    }
    line.push_str(" |");
    for byte in shown {
        let _ = write!(line, "{byte:02x}");
    }
    line.push_str("|\n");
    line
}

/// Sixteen bytes per row under a column ruler, offsets in hex.
pub fn hex_dump(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(TRACE_MAX_BYTES)];
    let mut out = String::with_capacity(64 + shown.len() * 3);
    out.push_str("---- 00-01-02-03-04-05-06-07-08-09-0A-0B-0C-0D-0E-0F");
    for (idx, byte) in shown.iter().enumerate() {
        if idx % 16 == 0 {
            let _ = write!(out, "\n{:04X} ", idx);
        }
        let _ = write!(out, "{:02X} ", byte);
    }
    out.push('\n');
    out
}
