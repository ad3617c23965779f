mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;

use common::{Lockstep, init_logging, next_endpoint, test_config, wait_for_players};
use turnlock::desync::{Category, TurnChecksums};
use turnlock::{
    MemoryNetwork, NetHooks, NoHooks, ServiceKind, Session, SessionError, SyncedGame,
    ThingClasses,
};

struct ProgressLog {
    steps: Rc<RefCell<Vec<u32>>>,
}

impl NetHooks for ProgressLog {
    fn resync_progress(&mut self, step: u32, total: u32) {
        assert_eq!(total, 6);
        self.steps.borrow_mut().push(step);
    }
}

struct Resynced {
    desyncs: Vec<u32>,
    report_turn: Option<u32>,
    things_mismatch: bool,
    checksum_after: u32,
    state_after: Vec<u8>,
    progress: Vec<u32>,
}

#[test]
fn test_desync_at_turn_seven_then_resync() {
    init_logging();
    let network = MemoryNetwork::new();
    let endpoint = next_endpoint("resync");
    let (hosted_tx, hosted_rx) = mpsc::channel();

    let run = move |network: MemoryNetwork, endpoint: String, host: bool, hosted: mpsc::Sender<()>| {
        let steps = Rc::new(RefCell::new(Vec::new()));
        let hooks = ProgressLog {
            steps: steps.clone(),
        };
        let mut session =
            Session::init(ServiceKind::Memory(network), test_config(), Box::new(hooks)).unwrap();
        if host {
            session.host(&endpoint, "Host", "").unwrap();
            hosted.send(()).unwrap();
        } else {
            session.join(&endpoint, "Client", "").unwrap();
        }
        wait_for_players(&mut session, 2);

        let mut lockstep = Lockstep::new(session.config());
        let mut desyncs = Vec::new();
        while desyncs.is_empty() {
            // the client's state drifts right before turn 7's checksum
            if !host && lockstep.sent == 6 {
                lockstep.world.things[1].health -= 5;
            }
            if lockstep.advance(&mut session) {
                desyncs.push(lockstep.world.turn);
            }
            assert!(lockstep.world.turn < 12, "desync never detected");
        }
        assert_eq!(session.desync().desync_turn(), Some(7));

        let report = session.resync_game(&mut lockstep.world).unwrap();
        assert!(session.desync().desync_turn().is_none());
        assert!(session.time_sync_state().resume_at.is_some());

        let view = lockstep.world.view(lockstep.sent + 1);
        let checksum_after = TurnChecksums::compute(&view, ThingClasses::default()).total;
        let progress = steps.borrow().clone();
        Resynced {
            desyncs,
            report_turn: report.as_ref().map(|r| r.turn),
            things_mismatch: report
                .as_ref()
                .and_then(|r| r.category(Category::Things))
                .is_some_and(|c| !c.matches()),
            checksum_after,
            state_after: lockstep.world.save_state(),
            progress,
        }
    };

    let host_network = network.clone();
    let host_endpoint = endpoint.clone();
    let host = thread::spawn(move || run(host_network, host_endpoint, true, hosted_tx));
    hosted_rx.recv().unwrap();
    let (unused_tx, _) = mpsc::channel();
    let client = thread::spawn(move || run(network, endpoint, false, unused_tx));

    let host = host.join().unwrap();
    let client = client.join().unwrap();

    // detected while simulating turn 7 on both sides
    assert_eq!(host.desyncs, vec![7]);
    assert_eq!(client.desyncs, vec![7]);

    // only the client diagnoses, against the history the host shipped
    assert_eq!(host.report_turn, None);
    assert_eq!(client.report_turn, Some(7));
    assert!(client.things_mismatch);

    assert_eq!(host.state_after, client.state_after);
    assert_eq!(host.checksum_after, client.checksum_after);

    assert_eq!(host.progress.first(), Some(&0));
    assert_eq!(host.progress.last(), Some(&6));
    assert!(host.progress.contains(&3));
    assert!(client.progress.contains(&4));
    assert_eq!(client.progress.last(), Some(&6));
}

#[test]
fn test_resync_times_out_without_host_data() {
    init_logging();
    let network = MemoryNetwork::new();
    let endpoint = next_endpoint("silent");
    let mut config = test_config();
    config.resync_timeout_ms = 200;

    let mut host =
        Session::init(ServiceKind::Memory(network.clone()), config.clone(), Box::new(NoHooks))
            .unwrap();
    host.host(&endpoint, "Host", "").unwrap();

    let (finished_tx, finished_rx) = mpsc::channel();
    let client = thread::spawn(move || {
        let mut client =
            Session::init(ServiceKind::Memory(network), config, Box::new(NoHooks)).unwrap();
        client.join(&endpoint, "Client", "").unwrap();

        let mut world = common::ToyWorld::new();
        let result = client.resync_game(&mut world);
        finished_tx.send(()).unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Resync(turnlock::ResyncError::Timeout))
        ));
    });

    // answer the login and keep the link alive without ever sending state
    while finished_rx.try_recv().is_err() {
        host.service().unwrap();
        thread::sleep(std::time::Duration::from_millis(5));
    }
    client.join().unwrap();
}

type Events = Rc<RefCell<Vec<&'static str>>>;

struct PauseLog {
    events: Events,
}

impl NetHooks for PauseLog {
    fn pause_changed(&mut self, paused: bool) {
        self.events.borrow_mut().push(if paused { "paused" } else { "resumed" });
    }
}

struct WatchedWorld {
    world: common::ToyWorld,
    events: Events,
}

impl SyncedGame for WatchedWorld {
    fn state_size(&self) -> usize {
        self.world.state_size()
    }

    fn save_state(&self) -> Vec<u8> {
        self.events.borrow_mut().push("saved");
        self.world.save_state()
    }

    fn load_state(&mut self, state: &[u8]) -> Result<(), turnlock::ResyncError> {
        self.world.load_state(state)
    }
}

#[test]
fn test_host_resync_sends_state_unpaused() {
    init_logging();
    let network = MemoryNetwork::new();
    let endpoint = next_endpoint("resync-pause");
    let events = Events::default();

    let hooks = PauseLog {
        events: events.clone(),
    };
    let mut host =
        Session::init(ServiceKind::Memory(network), test_config(), Box::new(hooks)).unwrap();
    host.host(&endpoint, "Host", "").unwrap();
    host.send_pause_immediate(true, 0).unwrap();
    // a delayed unpause is still pending when the resync starts
    host.send_pause_immediate(false, 5000).unwrap();
    assert!(host.has_scheduled_unpause());

    let mut world = WatchedWorld {
        world: common::ToyWorld::new(),
        events: events.clone(),
    };
    assert!(host.resync_game(&mut world).unwrap().is_none());
    assert_eq!(*events.borrow(), vec!["paused", "resumed", "saved"]);
    assert!(!host.has_scheduled_unpause());
}
