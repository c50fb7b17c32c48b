pub mod config;
pub mod net;
pub mod telemetry;
pub mod world;

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

pub use net::broadcast::{
    AreaFlags, BroadcastScope, DeliveryReport, FrameContext, Resolver, ResolverSettings,
    RosterVariant,
};
pub use net::codec::{FieldView, FrameBuilder};
pub use net::dispatch::{
    CloseReason, DispatchSettings, Dispatcher, HandlerContext, HandlerTable, PumpEnd, PumpReport,
};
pub use net::error::{DecodeError, EncodeError, HandlerError, LengthError, ProtocolError};
pub use net::registry::PacketRegistry;
pub use net::schema::{Epoch, Opcode};
pub use net::session::{ConnectionId, Session, SessionTable};
pub use net::visibility::VisibilityPolicy;
pub use world::entity::{Entity, EntityId, EntityKind};
pub use world::index::{WorldIndex, WorldView};

use config::{Cli, Command, EngineConfig};
use telemetry::trace::PacketTrace;

/// Entity the decode replay binds its session to unless `--anonymous`.
const REPLAY_ENTITY: EntityId = EntityId(1);

pub fn run(args: &[String]) -> Result<(), String> {
    let cli = Cli::from_args(args)?;
    match cli.command {
        Command::Check { config } => check(&config),
        Command::Decode {
            config,
            capture,
            epoch,
            anonymous,
        } => decode(&config, &capture, epoch, anonymous),
    }
}

fn load(config: &Path) -> Result<(EngineConfig, PacketRegistry), String> {
    let config = EngineConfig::load(config).map_err(|err| err.to_string())?;
    telemetry::logging::init(&config.log_config())?;
    let registry = PacketRegistry::load(&config.packet_db, config.max_variable_length)
        .map_err(|err| err.to_string())?;
    log::info!(
        "packet db {} loaded: {} opcodes",
        config.packet_db.display(),
        registry.len()
    );
    Ok((config, registry))
}

fn check(path: &Path) -> Result<(), String> {
    let (config, registry) = load(path)?;
    let mut handlers = HandlerTable::<WorldIndex>::new();
    net::game_client::register_core_handlers(
        &mut handlers,
        net::game_client::OpenGate::new(1, 0, 0),
    );

    println!("mapwire: packet db {}", config.packet_db.display());
    println!("- opcodes: {}", registry.len());
    println!("- max variable length: {}", registry.max_variable_length());
    for epoch in registry.epochs() {
        let summary = registry.summary(epoch);
        println!(
            "- epoch {}: fixed={}, variable={}, pre_auth={}",
            summary.epoch, summary.fixed, summary.variable, summary.pre_auth
        );
    }
    let mut unbound = 0;
    for schema in registry.iter() {
        if let Some(name) = schema.handler.as_deref() {
            if !handlers.contains(name) {
                unbound += 1;
                println!(
                    "- warning: {:#06x} {} names unknown handler '{}'",
                    schema.opcode, schema.name, name
                );
            }
        }
    }
    if unbound > 0 {
        return Err(format!("{unbound} opcode(s) name unknown handlers"));
    }
    Ok(())
}

fn decode(config: &Path, capture: &Path, epoch: Option<u32>, anonymous: bool) -> Result<(), String> {
    let (config, registry) = load(config)?;
    let bytes = std::fs::read(capture)
        .map_err(|err| format!("read {}: {}", capture.display(), err))?;
    let epoch = epoch.map(Epoch).unwrap_or_else(|| config.epoch());
    let trace = PacketTrace::from_env(&config.trace_dir, "decode");
    let replay = replay_capture(
        Arc::new(registry),
        config.dispatch_settings(),
        config.session_table(),
        trace,
        epoch,
        &bytes,
        anonymous,
    )?;

    println!("mapwire: {} ({} bytes, epoch {})", capture.display(), bytes.len(), epoch);
    for line in &replay.lines {
        println!("{line}");
    }
    println!(
        "- frames={}, dispatched={}, skipped={}, dropped={}, unauthorized={}",
        replay.report.frames,
        replay.report.dispatched,
        replay.report.skipped,
        replay.report.dropped,
        replay.report.unauthorized
    );
    if replay.trailing > 0 {
        println!("- {} trailing bytes of an incomplete frame", replay.trailing);
    }
    match replay.report.end {
        PumpEnd::Closed(reason) => Err(format!("capture rejected: {reason}")),
        _ => Ok(()),
    }
}

/// Result of feeding a whole byte capture through one session.
#[derive(Debug, Clone, Default)]
pub struct Replay {
    /// One line per decoded frame, in arrival order.
    pub lines: Vec<String>,
    /// Totals across every pump; `end` is the last pump's.
    pub report: PumpReport,
    /// Bytes left in the inbound buffer.
    pub trailing: usize,
}

/// Replays `bytes` as if one client had sent them, printing every frame the
/// dispatcher hands to a handler. The replay connection is opened in
/// `sessions`.
pub fn replay_capture(
    registry: Arc<PacketRegistry>,
    settings: DispatchSettings,
    mut sessions: SessionTable,
    trace: Option<PacketTrace>,
    epoch: Epoch,
    bytes: &[u8],
    anonymous: bool,
) -> Result<Replay, String> {
    let lines = Rc::new(RefCell::new(Vec::new()));
    let mut handlers = HandlerTable::<WorldIndex>::new();
    let sink = Rc::clone(&lines);
    handlers.set_fallback(move |_ctx, view| {
        let mut line = format!(
            "{:#06x} {} len={}",
            view.opcode(),
            view.schema().name,
            view.bytes().len()
        );
        for (name, value) in view.values()? {
            line.push_str(&format!(" {name}={value}"));
        }
        sink.borrow_mut().push(line);
        Ok(())
    });

    let mut world = WorldIndex::new();
    let mut dispatcher = Dispatcher::new(registry, settings).with_trace(trace);
    let mut replay = Replay::default();
    let id = sessions
        .accept(epoch)
        .ok_or_else(|| format!("no free session slot ({} open)", sessions.len()))?;
    if !anonymous {
        if let Err(err) = sessions.attach(id, REPLAY_ENTITY) {
            log::warn!("replay session {} not bound: {}", id, err);
            return Err(format!("bind replay session: {err}"));
        }
    }
    if let Some(session) = sessions.get_mut(id) {
        session.receive(bytes);
    }

    loop {
        let report = dispatcher.pump(&mut sessions, id, &mut world, &mut handlers);
        replay.report.frames += report.frames;
        replay.report.dispatched += report.dispatched;
        replay.report.skipped += report.skipped;
        replay.report.dropped += report.dropped;
        replay.report.unauthorized += report.unauthorized;
        replay.report.end = report.end;
        if replay.report.end != PumpEnd::Yielded {
            break;
        }
    }
    replay.trailing = sessions
        .get(id)
        .map(|session| session.inbound().available())
        .unwrap_or(0);
    replay.lines = lines.take();
    Ok(replay)
}
