//! Scheduler + control surface tests against a simulated ECU fleet

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tp2d::bus::{BusError, Sample, SamplePublisher, SystemEvents};
use tp2d::channel::CanFrame;
use tp2d::control;
use tp2d::hardware::sim::{SimulationChannel, SimulationInterface};
use tp2d::measure::Value;
use tp2d::scheduler::{GatewayState, Scheduler, SharedState};

#[derive(Default)]
struct FleetState {
    /// (module, group) pairs whose responses get lost on the wire
    fail_groups: HashSet<(u8, u8)>,
    /// ReadDataByLocalIdentifier counts per (module, group)
    requests: HashMap<(u8, u8), u32>,
    /// Modules that received a 0xA8 from the tester
    disconnects: Vec<u8>,
}

type SharedFleet = Arc<Mutex<FleetState>>;

fn push_response(queue: &mut VecDeque<CanFrame>, tester: u16, seq: &mut u8, payload: &[u8]) {
    let mut frame = vec![0x10 | *seq, 0x00, payload.len() as u8];
    *seq = (*seq + 1) & 0x0F;
    frame.extend_from_slice(payload);
    queue.push_back(CanFrame::new(tester, &frame));
}

/// Simulates every ECU on the bus. Each opened channel learns its target
/// module from the setup broadcast; measuring-block reads report one
/// type-1 triplet whose value equals the group number.
fn fleet_interface(fleet: SharedFleet, testers: HashMap<u8, u16>) -> SimulationInterface {
    SimulationInterface::new(move || {
        let fleet = fleet.clone();
        let testers = testers.clone();
        let mut module = 0u8;
        let mut tester = 0u16;
        let mut tx_id = 0u16;
        let mut ecu_seq = 0u8;
        SimulationChannel::new(move |id, data, queue| {
            let Some(&op) = data.first() else {
                return;
            };
            if id == 0x200 && data.get(1) == Some(&0xC0) {
                module = op;
                tester = testers.get(&module).copied().unwrap_or(0x300);
                tx_id = 0x700 | u16::from(module);
                ecu_seq = 0;
                queue.push_back(CanFrame::new(
                    0x201,
                    &[
                        0x00,
                        0xD0,
                        0x00,
                        0x03,
                        (tx_id & 0xFF) as u8,
                        (tx_id >> 8) as u8,
                        0x00,
                    ],
                ));
                return;
            }
            if id != tx_id {
                return;
            }
            match op {
                0xA0 | 0xA3 => queue.push_back(CanFrame::new(tester, &[0xA1])),
                0xA8 => fleet.lock().unwrap().disconnects.push(module),
                op if op & 0xF0 == 0x10 => {
                    let len = usize::from(data[2]);
                    let payload = &data[3..3 + len];
                    queue.push_back(CanFrame::new(tester, &[0xB0 | (op + 1) & 0x0F]));
                    match payload {
                        [0x10, session] => {
                            push_response(queue, tester, &mut ecu_seq, &[0x50, *session]);
                        }
                        [0x21, group] => {
                            let mut st = fleet.lock().unwrap();
                            *st.requests.entry((module, *group)).or_insert(0) += 1;
                            if !st.fail_groups.contains(&(module, *group)) {
                                push_response(
                                    queue,
                                    tester,
                                    &mut ecu_seq,
                                    &[0x61, *group, 0x01, 0x05, *group],
                                );
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        })
    })
}

#[derive(Clone, Default)]
struct MemoryPublisher {
    samples: Arc<Mutex<Vec<Sample>>>,
}

impl SamplePublisher for MemoryPublisher {
    fn publish(&mut self, sample: &Sample) -> Result<(), BusError> {
        self.samples.lock().unwrap().push(sample.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
struct QueueEvents {
    queue: Arc<Mutex<VecDeque<bool>>>,
}

impl SystemEvents for QueueEvents {
    fn poll_ignition(&mut self) -> Option<bool> {
        self.queue.lock().unwrap().pop_front()
    }
}

struct Harness {
    state: SharedState,
    scheduler: Scheduler,
    samples: Arc<Mutex<Vec<Sample>>>,
    fleet: SharedFleet,
    ignition: Arc<Mutex<VecDeque<bool>>>,
}

/// Builds a gateway over the simulated fleet. `testers` fixes the expected
/// tester id per module; subscribe modules in the same order.
fn harness(testers: &[(u8, u16)]) -> Harness {
    let fleet: SharedFleet = Arc::default();
    let publisher = MemoryPublisher::default();
    let events = QueueEvents::default();
    let state: SharedState = Arc::new(Mutex::new(GatewayState::new()));
    let scheduler = Scheduler::new(
        state.clone(),
        Box::new(fleet_interface(
            fleet.clone(),
            testers.iter().copied().collect(),
        )),
        Box::new(publisher.clone()),
        Some(Box::new(events.clone())),
        Arc::new(AtomicBool::new(false)),
    );
    Harness {
        state,
        scheduler,
        samples: publisher.samples,
        fleet,
        ignition: events.queue,
    }
}

impl Harness {
    fn cmd(&self, raw: &str) -> serde_json::Value {
        serde_json::from_str(&control::handle_request(&self.state, raw)).unwrap()
    }

    fn run(&mut self, iterations: usize) {
        for _ in 0..iterations {
            self.scheduler.run_once();
        }
    }

    fn session_status(&self, module: u8) -> serde_json::Value {
        let status = self.cmd(r#"{"cmd":"STATUS"}"#);
        status["sessions"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["module"] == module)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    fn reads(&self, module: u8, group: u8) -> u32 {
        self.fleet
            .lock()
            .unwrap()
            .requests
            .get(&(module, group))
            .copied()
            .unwrap_or(0)
    }
}

#[test]
fn subscribing_starts_polling_and_publishing() {
    let mut h = harness(&[(0x01, 0x300)]);
    h.cmd(r#"{"cmd":"ADD","module":1,"group":2}"#);
    h.run(3);

    let samples = h.samples.lock().unwrap();
    assert!(samples.len() >= 2, "got {} samples", samples.len());
    let sample = &samples[0];
    assert_eq!(sample.module, 0x01);
    assert_eq!(sample.group, 2);
    assert_eq!(sample.data.len(), 1);
    assert_eq!(sample.data[0].kind, 1);
    assert_eq!(sample.data[0].unit, "rpm");
    assert_eq!(sample.data[0].value, Value::Number(2.0));
    drop(samples);

    let status = h.session_status(0x01);
    assert_eq!(status["connected"], true);
    assert_eq!(status["active"], true);
    assert_eq!(status["groups"], serde_json::json!([2]));
}

#[test]
fn failing_group_cools_down_without_starving_the_rest() {
    let mut h = harness(&[(0x01, 0x300)]);
    h.cmd(r#"{"cmd":"ADD","module":1,"group":1}"#);
    h.cmd(r#"{"cmd":"ADD","module":1,"group":9}"#);
    h.fleet.lock().unwrap().fail_groups.insert((0x01, 9));

    // connect, then alternate between the groups until 9 hits its third
    // failure and goes into cooldown
    h.run(14);

    assert_eq!(h.reads(0x01, 9), 3, "group 9 must stop after 3 failures");
    assert!(h.reads(0x01, 1) >= 6, "group 1 kept polling");
    let polled_while_cooling = h.reads(0x01, 1);

    h.run(4);
    assert_eq!(h.reads(0x01, 9), 3, "group 9 stays suspended");
    assert!(h.reads(0x01, 1) > polled_while_cooling);

    // the suspended group is still subscribed and the session stays up
    let status = h.session_status(0x01);
    assert_eq!(status["connected"], true);
    assert_eq!(status["groups"], serde_json::json!([1, 9]));
}

#[test]
fn ignition_off_disconnects_but_preserves_subscriptions() {
    let mut h = harness(&[(0x01, 0x300), (0x17, 0x301)]);
    h.cmd(r#"{"cmd":"ADD","module":1,"group":2}"#);
    h.cmd(r#"{"cmd":"ADD","module":23,"group":1}"#);
    h.run(3);
    assert_eq!(h.session_status(0x01)["connected"], true);
    assert_eq!(h.session_status(0x17)["connected"], true);

    h.ignition.lock().unwrap().push_back(false);
    h.run(1);

    let status = h.cmd(r#"{"cmd":"STATUS"}"#);
    assert_eq!(status["enabled"], false);
    for session in status["sessions"].as_array().unwrap() {
        assert_eq!(session["connected"], false);
        assert!(!session["groups"].as_array().unwrap().is_empty());
    }
    {
        let fleet = h.fleet.lock().unwrap();
        assert!(fleet.disconnects.contains(&0x01));
        assert!(fleet.disconnects.contains(&0x17));
    }

    // nothing is polled while disabled
    let stalled = h.samples.lock().unwrap().len();
    h.run(2);
    assert_eq!(h.samples.lock().unwrap().len(), stalled);

    // ignition back on: polling resumes without re-subscribing
    h.ignition.lock().unwrap().push_back(true);
    h.run(3);
    assert_eq!(h.cmd(r#"{"cmd":"STATUS"}"#)["enabled"], true);
    assert!(h.samples.lock().unwrap().len() > stalled);
    assert_eq!(h.session_status(0x01)["connected"], true);
    assert_eq!(h.session_status(0x17)["connected"], true);
}

#[test]
fn toggle_gates_polling_like_ignition_but_manually() {
    let mut h = harness(&[(0x01, 0x300)]);
    h.cmd(r#"{"cmd":"ADD","module":1,"group":4}"#);
    h.run(2);
    assert_eq!(h.session_status(0x01)["connected"], true);

    let reply = h.cmd(r#"{"cmd":"TOGGLE"}"#);
    assert_eq!(reply["enabled"], false);
    h.run(1);
    assert_eq!(h.session_status(0x01)["connected"], false);

    h.cmd(r#"{"cmd":"TOGGLE"}"#);
    let before = h.samples.lock().unwrap().len();
    h.run(3);
    assert!(h.samples.lock().unwrap().len() > before);
}

#[test]
fn clear_retires_every_session() {
    let mut h = harness(&[(0x01, 0x300), (0x02, 0x301)]);
    h.cmd(r#"{"cmd":"ADD","module":1,"group":1}"#);
    h.cmd(r#"{"cmd":"ADD","module":2,"group":3}"#);
    h.run(2);

    h.cmd(r#"{"cmd":"CLEAR"}"#);
    h.run(1);

    let status = h.cmd(r#"{"cmd":"STATUS"}"#);
    assert_eq!(status["session_count"], 0);
    let fleet = h.fleet.lock().unwrap();
    assert!(fleet.disconnects.contains(&0x01));
    assert!(fleet.disconnects.contains(&0x02));
}

#[test]
fn removing_the_last_group_retires_the_session() {
    let mut h = harness(&[(0x01, 0x300)]);
    h.cmd(r#"{"cmd":"ADD","module":1,"group":2}"#);
    h.run(2);
    assert_eq!(h.session_status(0x01)["connected"], true);

    h.cmd(r#"{"cmd":"REMOVE","module":1,"group":2}"#);
    h.run(1);
    assert_eq!(h.cmd(r#"{"cmd":"STATUS"}"#)["session_count"], 0);
    assert!(h.fleet.lock().unwrap().disconnects.contains(&0x01));
}
