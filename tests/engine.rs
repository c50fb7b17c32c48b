use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use mapwire::net::game::{write_version_reply, OPCODE_AUTH_OK};
use mapwire::net::game_client::{register_core_handlers, OpenGate};
use mapwire::net::packet::read_u16_le;
use mapwire::{
    replay_capture, CloseReason, ConnectionId, DispatchSettings, Dispatcher, Entity, EntityId,
    Epoch, HandlerTable, LengthError, PacketRegistry, ProtocolError, PumpEnd, SessionTable,
    WorldIndex, WorldView,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DB: &str = include_str!("../db/packet_db.yml");
const OLD: Epoch = Epoch(20031231);
const NEW: Epoch = Epoch(20040705);

fn registry() -> Arc<PacketRegistry> {
    Arc::new(PacketRegistry::from_yaml_str(DB, 32768).expect("packet db"))
}

fn pump_until_idle(
    dispatcher: &mut Dispatcher,
    sessions: &mut SessionTable,
    id: ConnectionId,
    world: &mut WorldIndex,
    handlers: &mut HandlerTable<WorldIndex>,
) -> PumpEnd {
    loop {
        let report = dispatcher.pump(sessions, id, world, handlers);
        if report.end != PumpEnd::Yielded {
            return report.end;
        }
    }
}

fn random_frame(rng: &mut StdRng) -> (Vec<u8>, bool) {
    match rng.gen_range(0..4) {
        0 => {
            let mut frame = vec![0x7e, 0x00];
            frame.extend_from_slice(&rng.gen::<u32>().to_le_bytes());
            (frame, true)
        }
        1 => {
            let len = rng.gen_range(0..60usize);
            let body: Vec<u8> = (0..len).map(|_| rng.gen_range(b'a'..=b'z')).collect();
            let mut frame = vec![0x8c, 0x00];
            frame.extend_from_slice(&((body.len() + 4) as u16).to_le_bytes());
            frame.extend_from_slice(&body);
            (frame, true)
        }
        2 => {
            let mut frame = vec![0x9b, 0x00];
            frame.extend_from_slice(&rng.gen::<u16>().to_le_bytes());
            frame.push(rng.gen_range(0..8));
            (frame, true)
        }
        _ => (vec![0x7d, 0x00], false),
    }
}

#[test]
fn randomized_reassembly_preserves_frames() {
    let mut rng = StdRng::seed_from_u64(0x6d61_7077);
    let mut stream = Vec::new();
    let mut expected = Vec::new();
    let mut unhandled = 0;
    for _ in 0..1000 {
        let (frame, handled) = random_frame(&mut rng);
        stream.extend_from_slice(&frame);
        if handled {
            expected.push(frame);
        } else {
            unhandled += 1;
        }
    }

    let seen: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let mut handlers = HandlerTable::<WorldIndex>::new();
    for name in ["tick_send", "global_message", "change_dir"] {
        let seen = Rc::clone(&seen);
        handlers.register(name, move |_ctx, view| {
            seen.borrow_mut().push(view.bytes().to_vec());
            Ok(())
        });
    }

    let mut dispatcher = Dispatcher::new(registry(), DispatchSettings::default());
    let mut sessions = SessionTable::new(4);
    let mut world = WorldIndex::new();
    let id = sessions.accept(OLD).expect("slot");
    sessions.attach(id, EntityId(1)).expect("attach");

    let mut skipped = 0;
    let mut offset = 0;
    while offset < stream.len() {
        let chunk = rng.gen_range(1..=40).min(stream.len() - offset);
        sessions
            .get_mut(id)
            .expect("session")
            .receive(&stream[offset..offset + chunk]);
        offset += chunk;
        loop {
            let report = dispatcher.pump(&mut sessions, id, &mut world, &mut handlers);
            skipped += report.skipped;
            match report.end {
                PumpEnd::Yielded => continue,
                PumpEnd::Starved => break,
                PumpEnd::Closed(reason) => panic!("closed mid-stream: {reason}"),
            }
        }
    }

    assert_eq!(*seen.borrow(), expected);
    assert_eq!(skipped, unhandled);
    assert!(sessions.get(id).expect("session").inbound().is_empty());
}

fn connect_frame(epoch: Epoch, account: u32) -> Vec<u8> {
    let (len, offset) = if epoch >= NEW { (22, 5) } else { (19, 2) };
    let mut frame = vec![0u8; len];
    frame[0] = 0x72;
    frame[offset..offset + 4].copy_from_slice(&account.to_le_bytes());
    frame
}

#[test]
fn clients_of_different_epochs_share_an_area() {
    let mut dispatcher = Dispatcher::new(registry(), DispatchSettings::default());
    let mut sessions = SessionTable::new(8);
    let mut world = WorldIndex::new();
    let mut handlers = HandlerTable::new();
    register_core_handlers(&mut handlers, OpenGate::new(3, 150, 150));

    let old = sessions.accept(OLD).expect("old");
    let new = sessions.accept(NEW).expect("new");
    for (id, epoch, account) in [(old, OLD, 10u32), (new, NEW, 11)] {
        sessions
            .get_mut(id)
            .expect("session")
            .receive(&connect_frame(epoch, account));
        pump_until_idle(&mut dispatcher, &mut sessions, id, &mut world, &mut handlers);
        let out = dispatcher.flush(&mut sessions, id);
        assert_eq!(&out[..4], &account.to_le_bytes());
        assert_eq!(read_u16_le(&out, 4), Some(OPCODE_AUTH_OK));
    }
    assert_eq!(world.players_in_area(world_pos(), 1).len(), 2);

    let mut chat = vec![0x8c, 0x00, 0x08, 0x00];
    chat.extend_from_slice(b"yo!\0");
    sessions.get_mut(new).expect("new").receive(&chat);
    pump_until_idle(&mut dispatcher, &mut sessions, new, &mut world, &mut handlers);

    let heard = dispatcher.flush(&mut sessions, old);
    assert_eq!(read_u16_le(&heard, 0), Some(0x008d));
    assert_eq!(&heard[4..8], &11i32.to_le_bytes());
    assert!(!dispatcher.flush(&mut sessions, new).is_empty());
}

fn world_pos() -> mapwire::world::position::Position {
    mapwire::world::position::Position::new(3, 150, 150)
}

#[test]
fn unknown_opcode_closes_and_is_reaped() {
    let mut dispatcher = Dispatcher::new(registry(), DispatchSettings::default());
    let mut sessions = SessionTable::new(2);
    let mut world = WorldIndex::new();
    world.insert(Entity::pc(5, world_pos()));
    let mut handlers = HandlerTable::new();
    register_core_handlers(&mut handlers, OpenGate::new(3, 150, 150));

    let id = sessions.accept(OLD).expect("slot");
    sessions.attach(id, EntityId(5)).expect("attach");
    let mut bytes = vec![0x34, 0x12, 0x00, 0x00];
    bytes.extend_from_slice(&[0x7e, 0x00, 1, 2, 3, 4]);
    sessions.get_mut(id).expect("session").receive(&bytes);
    let end = pump_until_idle(&mut dispatcher, &mut sessions, id, &mut world, &mut handlers);
    assert_eq!(
        end,
        PumpEnd::Closed(CloseReason::Protocol(ProtocolError::UnknownOpcode {
            opcode: 0x1234
        }))
    );
    assert!(dispatcher.flush(&mut sessions, id).is_empty());
    assert_eq!(sessions.reap_closed(), vec![id]);
    assert_eq!(sessions.session_of(EntityId(5)), None);
}

#[test]
fn version_query_answers_before_login() {
    let config = mapwire::config::EngineConfig::from_yaml_str("server_version: { major: 4, mod_version: 513 }")
        .expect("config");
    let settings = config.dispatch_settings();
    let version = settings.version;
    let mut dispatcher = Dispatcher::new(registry(), settings);
    let mut sessions = SessionTable::new(2);
    let mut world = WorldIndex::new();
    let mut handlers = HandlerTable::new();

    let id = sessions.accept(OLD).expect("slot");
    sessions.get_mut(id).expect("session").receive(&[0x30, 0x75, 0x30, 0x75]);
    let end = pump_until_idle(&mut dispatcher, &mut sessions, id, &mut world, &mut handlers);
    assert_eq!(end, PumpEnd::Starved);
    let out = dispatcher.flush(&mut sessions, id);
    let reply = write_version_reply(&version);
    assert_eq!(out.len(), 2 * reply.len());
    assert_eq!(out[2], 4);
    assert_eq!(&out[8..10], &513u16.to_le_bytes());
}

#[test]
fn auth_flood_closes_unauthenticated_connection() {
    let mut dispatcher = Dispatcher::new(
        registry(),
        DispatchSettings {
            auth_offense_limit: 3,
            ..DispatchSettings::default()
        },
    );
    let mut sessions = SessionTable::new(2);
    let mut world = WorldIndex::new();
    let mut handlers = HandlerTable::new();
    register_core_handlers(&mut handlers, OpenGate::new(3, 150, 150));

    let id = sessions.accept(OLD).expect("slot");
    let mut bytes = Vec::new();
    for _ in 0..4 {
        bytes.extend_from_slice(&[0x7e, 0x00, 0, 0, 0, 0]);
    }
    sessions.get_mut(id).expect("session").receive(&bytes);
    let end = pump_until_idle(&mut dispatcher, &mut sessions, id, &mut world, &mut handlers);
    assert_eq!(end, PumpEnd::Closed(CloseReason::AuthFlood));
    assert!(world.is_empty());
}

#[test]
fn replay_lists_frames_and_respects_auth() {
    let mut capture = connect_frame(OLD, 42);
    capture.extend_from_slice(&[0x7e, 0x00, 0x10, 0x00, 0x00, 0x00]);
    capture.extend_from_slice(&[0x7d, 0x00, 0x7e]);

    let replay = replay_capture(
        registry(),
        DispatchSettings::default(),
        SessionTable::new(1),
        None,
        OLD,
        &capture,
        false,
    )
    .expect("replay");
    assert_eq!(replay.lines.len(), 3);
    assert!(replay.lines[0].starts_with("0x0072 WantToConnection len=19 account_id=42"));
    assert!(replay.lines[1].contains("client_tick=16"));
    assert_eq!(replay.trailing, 1);
    assert_eq!(replay.report.end, PumpEnd::Starved);

    let anonymous = replay_capture(
        registry(),
        DispatchSettings::default(),
        SessionTable::new(1),
        None,
        OLD,
        &capture,
        true,
    )
    .expect("replay");
    assert_eq!(anonymous.lines.len(), 1);
    assert_eq!(anonymous.report.unauthorized, 2);
}

#[test]
fn replay_fails_when_its_session_cannot_open_or_bind() {
    let capture = [0x7e, 0x00, 0x10, 0x00, 0x00, 0x00];

    let mut taken = SessionTable::new(2);
    let other = taken.accept(OLD).expect("slot");
    taken.attach(other, EntityId(1)).expect("attach");
    let err = replay_capture(
        registry(),
        DispatchSettings::default(),
        taken,
        None,
        OLD,
        &capture,
        false,
    )
    .expect_err("entity already bound");
    assert!(err.starts_with("bind replay session"), "{err}");

    let mut full = SessionTable::new(1);
    full.accept(OLD).expect("slot");
    let err = replay_capture(
        registry(),
        DispatchSettings::default(),
        full,
        None,
        OLD,
        &capture,
        true,
    )
    .expect_err("no slot");
    assert!(err.contains("no free session slot"), "{err}");
}

#[test]
fn variable_frame_shorter_than_its_fields_closes_session() {
    let mut dispatcher = Dispatcher::new(registry(), DispatchSettings::default());
    let mut sessions = SessionTable::new(2);
    let mut world = WorldIndex::new();
    world.insert(Entity::pc(5, world_pos()));
    let seen = Rc::new(RefCell::new(0usize));
    let mut handlers = HandlerTable::new();
    let counter = Rc::clone(&seen);
    handlers.set_fallback(move |_ctx, _view| {
        *counter.borrow_mut() += 1;
        Ok(())
    });

    let id = sessions.accept(NEW).expect("slot");
    sessions.attach(id, EntityId(5)).expect("attach");
    sessions
        .get_mut(id)
        .expect("session")
        .receive(&[0x8d, 0x00, 0x06, 0x00, 0x00, 0x00]);
    let end = pump_until_idle(&mut dispatcher, &mut sessions, id, &mut world, &mut handlers);
    assert_eq!(
        end,
        PumpEnd::Closed(CloseReason::Protocol(ProtocolError::MalformedLength {
            opcode: 0x008d,
            source: LengthError::TooShort {
                declared: 6,
                minimum: 8
            },
        }))
    );
    assert_eq!(*seen.borrow(), 0);
    assert!(sessions.get(id).expect("session").is_closed());
    assert_eq!(sessions.reap_closed(), vec![id]);
}

#[test]
fn run_check_and_decode() {
    let dir = std::env::temp_dir().join(format!("mapwire-run-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("dir");
    let config = dir.join("mapwire.yml");
    std::fs::write(
        &config,
        format!(
            "packet_db: {}/db/packet_db.yml\ndefault_epoch: 20031231\nlog_level: warn\n",
            env!("CARGO_MANIFEST_DIR")
        ),
    )
    .expect("config");
    let capture = dir.join("capture.bin");
    std::fs::write(&capture, [0x7e, 0x00, 1, 0, 0, 0]).expect("capture");

    let args = |rest: &[&str]| -> Vec<String> {
        std::iter::once("mapwire")
            .chain(rest.iter().copied())
            .map(String::from)
            .collect()
    };
    let config_arg = config.display().to_string();
    let capture_arg = capture.display().to_string();
    assert_eq!(mapwire::run(&args(&["check", &config_arg])), Ok(()));
    assert_eq!(
        mapwire::run(&args(&["decode", &config_arg, &capture_arg])),
        Ok(())
    );

    std::fs::write(&capture, [0xff, 0x00]).expect("capture");
    assert!(mapwire::run(&args(&["decode", &config_arg, &capture_arg])).is_err());
    let _ = std::fs::remove_dir_all(&dir);
}
