mod common;

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use common::{init_logging, next_endpoint, test_config, wait_for_players};
use turnlock::net::{DropEvent, MemoryTransport, TransportOptions};
use turnlock::{
    JoinError, MemoryNetwork, MessageType, NetConfig, NetHooks, NetMessage, NoHooks, Role,
    SERVER_ID, ServiceKind, Session, SessionError, TimeSyncError, Transport, UserId,
};

fn abort_by_panic(reason: &str) -> ! {
    panic!("aborted: {}", reason)
}

fn host_session(network: &MemoryNetwork, endpoint: &str, password: &str) -> Session {
    let mut host =
        Session::init(ServiceKind::Memory(network.clone()), test_config(), Box::new(NoHooks))
            .unwrap();
    host.host(endpoint, "Host", password).unwrap();
    host
}

fn raw_client(network: &MemoryNetwork, endpoint: &str) -> (MemoryTransport, mpsc::Receiver<DropEvent>) {
    let (drops_tx, drops_rx) = mpsc::channel();
    let mut raw = MemoryTransport::new(network.clone());
    raw.init(drops_tx).unwrap();
    raw.join(endpoint, &TransportOptions::default()).unwrap();
    (raw, drops_rx)
}

fn login_bytes(password: &str, name: &[u8]) -> Vec<u8> {
    let mut data = vec![MessageType::Login as u8];
    data.extend_from_slice(password.as_bytes());
    data.push(0);
    data.extend_from_slice(name);
    data
}

/// Runs a host on its own thread until `stop` fires. Returns the host's
/// final roster as (id, name) pairs.
fn spawn_host(
    network: MemoryNetwork,
    endpoint: String,
    password: &'static str,
) -> (mpsc::Sender<()>, thread::JoinHandle<Vec<(UserId, String)>>) {
    let (hosted_tx, hosted_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let mut host = host_session(&network, &endpoint, password);
        hosted_tx.send(()).unwrap();
        while stop_rx.try_recv().is_err() {
            host.service().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        host.roster()
            .iter()
            .filter(|u| u.is_logged_in())
            .map(|u| (u.id, u.name.clone()))
            .collect()
    });
    hosted_rx.recv().unwrap();
    (stop_tx, handle)
}

#[test]
fn test_slots_assigned_in_arrival_order() {
    init_logging();
    let network = MemoryNetwork::new();
    let endpoint = next_endpoint("slots");
    let (stop, host) = spawn_host(network.clone(), endpoint.clone(), "");

    let mut clients = Vec::new();
    for name in ["Alice", "Bob", "Carol"] {
        let mut client =
            Session::init(ServiceKind::Memory(network.clone()), test_config(), Box::new(NoHooks))
                .unwrap();
        let id = client.join(&endpoint, name, "").unwrap();
        clients.push((id, client));
    }
    let ids: Vec<UserId> = clients.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    // gossip converges on every client
    for (_, client) in &mut clients {
        wait_for_players(client, 4);
        assert_eq!(client.roster().get(2).unwrap().name, "Bob");
        assert_eq!(client.roster().get(0).unwrap().name, "Host");
    }

    stop.send(()).unwrap();
    let roster = host.join().unwrap();
    assert_eq!(
        roster,
        vec![
            (0, "Host".to_string()),
            (1, "Alice".to_string()),
            (2, "Bob".to_string()),
            (3, "Carol".to_string()),
        ]
    );
}

#[test]
fn test_wrong_password_rejected_and_slot_reused() {
    init_logging();
    let network = MemoryNetwork::new();
    let endpoint = next_endpoint("password");
    let (stop, host) = spawn_host(network.clone(), endpoint.clone(), "secret");

    let mut intruder =
        Session::init(ServiceKind::Memory(network.clone()), test_config(), Box::new(NoHooks))
            .unwrap();
    let result = intruder.join(&endpoint, "Mallory", "guess");
    assert!(matches!(
        result,
        Err(SessionError::Join(JoinError::Rejected))
    ));
    assert!(intruder.my_id().is_none());

    let mut player =
        Session::init(ServiceKind::Memory(network.clone()), test_config(), Box::new(NoHooks))
            .unwrap();
    assert_eq!(player.join(&endpoint, "Alice", "secret").unwrap(), 1);

    stop.send(()).unwrap();
    let roster = host.join().unwrap();
    assert_eq!(roster.len(), 2);
    assert_eq!(roster[1], (1, "Alice".to_string()));
}

#[test]
fn test_malformed_login_dropped_without_slot() {
    init_logging();
    let network = MemoryNetwork::new();
    let endpoint = next_endpoint("login");
    let mut host = host_session(&network, &endpoint, "");

    // name runs past its capacity without a terminator
    let (mut unterminated, unterminated_drops) = raw_client(&network, &endpoint);
    unterminated
        .send_single(SERVER_ID, &login_bytes("", &[b'A'; 40]))
        .unwrap();
    host.service().unwrap();
    assert_eq!(host.roster().active_ids(), vec![0]);
    assert_eq!(unterminated.message_ready(SERVER_ID, Duration::from_millis(50)), 0);
    assert_eq!(unterminated_drops.try_recv().unwrap().id, SERVER_ID);

    // names must start with a letter or digit
    let (mut underscore, underscore_drops) = raw_client(&network, &endpoint);
    underscore
        .send_single(SERVER_ID, &login_bytes("", b"_sneaky\0"))
        .unwrap();
    host.service().unwrap();
    assert_eq!(host.roster().logged_in_ids(), vec![0]);
    assert_eq!(underscore.message_ready(SERVER_ID, Duration::from_millis(50)), 0);
    assert!(underscore_drops.try_recv().is_ok());
}

#[test]
fn test_out_of_range_frame_peer_aborts_host() {
    init_logging();
    let network = MemoryNetwork::new();
    let endpoint = next_endpoint("frame-range");
    let mut host = host_session(&network, &endpoint, "");
    host.set_abort_handler(abort_by_panic);

    let (mut raw, _drops) = raw_client(&network, &endpoint);
    raw.send_single(SERVER_ID, &login_bytes("", b"Eve\0")).unwrap();
    host.service().unwrap();
    assert_eq!(host.roster().logged_in_ids(), vec![0, 1]);

    let mut frame = vec![MessageType::Frontend as u8, 9];
    frame.extend_from_slice(&0i32.to_le_bytes());
    frame.extend_from_slice(&[0; 8]);
    raw.send_single(SERVER_ID, &frame).unwrap();

    let result = panic::catch_unwind(AssertUnwindSafe(|| host.service()));
    let payload = result.unwrap_err();
    let message = payload.downcast_ref::<String>().unwrap();
    assert!(message.contains("out of range"), "{}", message);
}

#[test]
fn test_out_of_range_user_update_aborts_client() {
    init_logging();
    let network = MemoryNetwork::new();
    let endpoint = next_endpoint("update-range");
    let (ready_tx, ready_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let rogue_network = network.clone();
    let rogue_endpoint = endpoint.clone();
    let rogue = thread::spawn(move || {
        let (drops_tx, _drops_rx) = mpsc::channel();
        let mut host = MemoryTransport::new(rogue_network);
        host.init(drops_tx).unwrap();
        host.host(&rogue_endpoint, &TransportOptions::default()).unwrap();
        ready_tx.send(()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut accepted = false;
        while !accepted || host.message_ready(1, Duration::from_millis(5)) == 0 {
            assert!(Instant::now() < deadline);
            host.update(&mut || {
                accepted = true;
                Some(1)
            });
        }
        host.read_message(1, 256).unwrap();
        let reply = NetMessage::LoginReply { id: 1 }.encode().unwrap();
        host.send_single(1, &reply).unwrap();
        host.send_single(1, &[MessageType::UserUpdate as u8, 9, 2, b'x', 0]).unwrap();
        let _ = release_rx.recv();
    });

    ready_rx.recv().unwrap();
    let mut client =
        Session::init(ServiceKind::Memory(network), test_config(), Box::new(NoHooks)).unwrap();
    client.set_abort_handler(abort_by_panic);
    assert_eq!(client.join(&endpoint, "Victim", "").unwrap(), 1);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            client.service().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
    }));
    assert!(result.is_err());

    release_tx.send(()).unwrap();
    rogue.join().unwrap();
}

#[test]
fn test_closing_session_drops_half_joined_peers() {
    init_logging();
    let network = MemoryNetwork::new();
    let endpoint = next_endpoint("locked");
    let mut host = host_session(&network, &endpoint, "");

    let (mut lurker, lurker_drops) = raw_client(&network, &endpoint);
    host.service().unwrap();
    assert_eq!(host.roster().active_ids(), vec![0, 1]);

    host.enable_new_players(false);
    assert!(host.is_locked());
    assert_eq!(host.roster().active_ids(), vec![0]);
    assert_eq!(lurker.message_ready(SERVER_ID, Duration::from_millis(20)), 0);
    assert!(lurker_drops.try_recv().is_ok());

    let (mut late, late_drops) = raw_client(&network, &endpoint);
    host.service().unwrap();
    assert_eq!(host.roster().active_ids(), vec![0]);
    assert_eq!(late.message_ready(SERVER_ID, Duration::from_millis(20)), 0);
    assert!(late_drops.try_recv().is_ok());

    host.enable_new_players(true);
    let (_welcome, _) = raw_client(&network, &endpoint);
    host.service().unwrap();
    assert_eq!(host.roster().active_ids(), vec![0, 1]);
}

struct Recorder {
    events: Rc<RefCell<Vec<String>>>,
}

impl NetHooks for Recorder {
    fn pause_changed(&mut self, paused: bool) {
        self.events.borrow_mut().push(format!("pause {}", paused));
    }

    fn chat(&mut self, player: UserId, text: &str) {
        self.events.borrow_mut().push(format!("chat {} {}", player, text));
    }
}

#[test]
fn test_pause_and_chat_reach_clients() {
    init_logging();
    let network = MemoryNetwork::new();
    let endpoint = next_endpoint("chat");
    let mut host = host_session(&network, &endpoint, "");

    let (finished_tx, finished_rx) = mpsc::channel();
    let client_endpoint = endpoint.clone();
    let client = thread::spawn(move || {
        let events = Rc::new(RefCell::new(Vec::new()));
        let hooks = Recorder {
            events: events.clone(),
        };
        let mut client =
            Session::init(ServiceKind::Memory(network), test_config(), Box::new(hooks)).unwrap();
        client.join(&client_endpoint, "Client", "").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !client.has_scheduled_unpause() {
            assert!(Instant::now() < deadline, "pause messages never arrived");
            client.service().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(60));
        assert!(client.take_due_unpause());
        finished_tx.send(()).unwrap();
        events.borrow().clone()
    });

    wait_for_players(&mut host, 2);
    host.send_pause_immediate(true, 0).unwrap();
    host.send_chat_immediate(0, "hello").unwrap();
    host.send_pause_immediate(false, 50).unwrap();
    assert!(host.has_scheduled_unpause());

    while finished_rx.try_recv().is_err() {
        host.service().unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    let events = client.join().unwrap();
    assert_eq!(events, vec!["pause true", "chat 0 hello", "pause false"]);
}

fn short_sync_config() -> NetConfig {
    NetConfig {
        timesync_timeout_ms: 300,
        resume_timeout_ms: 300,
        ..test_config()
    }
}

#[test]
fn test_host_time_sync_drops_silent_peer() {
    init_logging();
    let network = MemoryNetwork::new();
    let endpoint = next_endpoint("sync-silent");
    let mut host =
        Session::init(ServiceKind::Memory(network.clone()), short_sync_config(), Box::new(NoHooks))
            .unwrap();
    host.host(&endpoint, "Host", "").unwrap();

    let (mut raw, _drops) = raw_client(&network, &endpoint);
    raw.send_single(SERVER_ID, &login_bytes("", b"Mute")).unwrap();
    wait_for_players(&mut host, 2);

    let started = Instant::now();
    host.time_sync().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(host.roster().logged_in_ids(), vec![SERVER_ID]);
    assert!(host.time_sync_state().resume_at.is_some());
}

#[test]
fn test_client_leaves_when_host_never_answers_time_sync() {
    init_logging();
    let network = MemoryNetwork::new();
    let endpoint = next_endpoint("sync-reply");
    // a host that only services never answers time sync requests
    let (stop, handle) = spawn_host(network.clone(), endpoint.clone(), "");

    let mut client =
        Session::init(ServiceKind::Memory(network), short_sync_config(), Box::new(NoHooks))
            .unwrap();
    assert_eq!(client.join(&endpoint, "Waiter", "").unwrap(), 1);
    let result = client.time_sync();
    assert!(
        matches!(result, Err(SessionError::TimeSync(TimeSyncError::ReplyTimeout))),
        "{:?}",
        result
    );
    assert_eq!(client.role(), Role::Idle);

    stop.send(()).unwrap();
    handle.join().unwrap();
}

#[test]
fn test_client_stays_connected_when_resume_never_arrives() {
    init_logging();
    let network = MemoryNetwork::new();
    let endpoint = next_endpoint("sync-resume");
    let (ready_tx, ready_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let host_network = network.clone();
    let host_endpoint = endpoint.clone();
    let host = thread::spawn(move || {
        let (drops_tx, _drops_rx) = mpsc::channel();
        let mut host = MemoryTransport::new(host_network);
        host.init(drops_tx).unwrap();
        host.host(&host_endpoint, &TransportOptions::default()).unwrap();
        ready_tx.send(()).unwrap();

        let slots = test_config().player_slots();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut accepted = false;
        let mut read_next = |host: &mut MemoryTransport| loop {
            assert!(Instant::now() < deadline);
            host.update(&mut || {
                accepted = true;
                Some(1)
            });
            if accepted && host.message_ready(1, Duration::from_millis(5)) > 0 {
                return host.read_message(1, 256).unwrap();
            }
        };

        read_next(&mut host);
        let reply = NetMessage::LoginReply { id: 1 }.encode().unwrap();
        host.send_single(1, &reply).unwrap();

        let request = read_next(&mut host);
        let Ok(NetMessage::TimeSyncRequest { client_send }) = NetMessage::decode(&request, slots)
        else {
            panic!("expected a time sync request");
        };
        let reply = NetMessage::TimeSyncReply {
            client_send,
            host_receive: 1_000,
            host_send: 1_050,
        };
        host.send_single(1, &reply.encode().unwrap()).unwrap();
        // completion arrives, the resume time never goes out
        let complete = read_next(&mut host);
        assert_eq!(MessageType::of(&complete).unwrap(), MessageType::TimeSyncComplete);
        let _ = release_rx.recv();
    });

    ready_rx.recv().unwrap();
    let mut client =
        Session::init(ServiceKind::Memory(network), short_sync_config(), Box::new(NoHooks))
            .unwrap();
    assert_eq!(client.join(&endpoint, "Patient", "").unwrap(), 1);
    let result = client.time_sync();
    assert!(
        matches!(result, Err(SessionError::TimeSync(TimeSyncError::ResumeTimeout))),
        "{:?}",
        result
    );
    assert_eq!(client.role(), Role::Client);
    assert_eq!(client.my_id(), Some(1));
    assert!(client.time_sync_state().rtt.is_some());
    assert!(client.time_sync_state().resume_at.is_none());

    release_tx.send(()).unwrap();
    host.join().unwrap();
}
