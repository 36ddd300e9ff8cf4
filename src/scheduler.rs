//! Polling scheduler
//!
//! Owns every [Session] and drives the single polling loop: ignition events
//! gate a global enabled flag, each active session is visited once per
//! iteration, decoded samples go out on the [crate::bus] fabric under the
//! `HUDIY_DIAG` topic, and tombstoned sessions are torn down and removed.
//!
//! The session map is shared with the control worker behind one mutex. The
//! polling worker only holds the lock to plan a tick or to fold an outcome
//! back in - never across CAN or fabric I/O. Channel handles move out of the
//! session for the duration of the bus dialogue and are given back
//! afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::bus::{Sample, SamplePublisher, SystemEvents};
use crate::channel::CanInterface;
use crate::kwp2000::{self, KwpClient};
use crate::measure;
use crate::session::{AfterPoll, PollOutcome, Session, TickAction};
use crate::tp20::{DEFAULT_TESTER_ID, Tp20Channel};
use crate::DiagError;

/// Sleep between scheduler iterations
const TICK_GAP: Duration = Duration::from_millis(50);
/// Sleep while polling is disabled
const DISABLED_IDLE: Duration = Duration::from_millis(500);
/// Sleep while no session exists
const EMPTY_IDLE: Duration = Duration::from_millis(100);
/// Back-off after an unexpected hardware failure
const RECOVERY_SLEEP: Duration = Duration::from_secs(1);

/// State shared between the polling worker and the control worker.
///
/// The control worker only touches subscription metadata and the enabled
/// flag; all channel I/O stays with the polling worker.
#[derive(Debug)]
pub struct GatewayState {
    pub(crate) sessions: HashMap<u8, Session>,
    pub(crate) enabled: bool,
    pub(crate) last_ignition: Option<bool>,
    next_tester_id: u16,
}

impl GatewayState {
    /// Creates an empty state: no sessions, polling enabled until ignition
    /// says otherwise
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            enabled: true,
            last_ignition: None,
            next_tester_id: DEFAULT_TESTER_ID,
        }
    }

    /// Looks up or creates the session for `module`, assigning the next
    /// free tester id on creation
    pub(crate) fn session_entry(&mut self, module: u8) -> &mut Session {
        match self.sessions.entry(module) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                let tester_id = self.next_tester_id;
                self.next_tester_id += 1;
                log::info!("new session for module 0x{module:02X} (tester id 0x{tester_id:X})");
                v.insert(Session::new(module, tester_id))
            }
        }
    }
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the shared gateway state
pub type SharedState = Arc<Mutex<GatewayState>>;

/// Locks the shared state, surviving a poisoned mutex
pub(crate) fn lock(state: &SharedState) -> MutexGuard<'_, GatewayState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The polling worker
pub struct Scheduler {
    state: SharedState,
    interface: Box<dyn CanInterface>,
    publisher: Box<dyn SamplePublisher>,
    events: Option<Box<dyn SystemEvents>>,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    /// Wires the scheduler up. `events` is the ignition source; without one
    /// the gateway stays permanently enabled.
    pub fn new(
        state: SharedState,
        interface: Box<dyn CanInterface>,
        publisher: Box<dyn SamplePublisher>,
        events: Option<Box<dyn SystemEvents>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state,
            interface,
            publisher,
            events,
            shutdown,
        }
    }

    /// Runs the polling loop until the shutdown flag is raised, then tears
    /// every channel down
    pub fn run(&mut self) {
        log::info!("TP2.0 gateway polling loop starting");
        while !self.shutdown.load(Ordering::Relaxed) {
            let idle = self.run_once();
            std::thread::sleep(idle);
        }
        self.disconnect_all();
        log::info!("TP2.0 gateway polling loop stopped");
    }

    /// One full scheduler iteration: ignition, then one visit per session.
    /// Returns how long the loop should idle before the next iteration.
    pub fn run_once(&mut self) -> Duration {
        self.poll_ignition();

        let (enabled, modules) = {
            let st = lock(&self.state);
            (st.enabled, st.sessions.keys().copied().collect::<Vec<u8>>())
        };

        if !enabled {
            self.disconnect_all();
            return DISABLED_IDLE;
        }
        if modules.is_empty() {
            return EMPTY_IDLE;
        }
        for module in modules {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.tick(module);
        }
        TICK_GAP
    }

    /// Drains pending ignition events. The first observation and every edge
    /// align the enabled flag with kl15; steady state preserves manual
    /// TOGGLE overrides.
    fn poll_ignition(&mut self) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        while let Some(kl15) = events.poll_ignition() {
            let mut st = lock(&self.state);
            match st.last_ignition {
                Some(prev) if prev == kl15 => {}
                prev => {
                    st.enabled = kl15;
                    st.last_ignition = Some(kl15);
                    log::info!(
                        "ignition {}: polling {}",
                        if prev.is_none() { "startup sync" } else { "change" },
                        if kl15 { "enabled" } else { "disabled" }
                    );
                }
            }
        }
    }

    fn tick(&mut self, module: u8) {
        let now = Instant::now();
        let action = {
            let mut st = lock(&self.state);
            match st.sessions.get_mut(&module) {
                Some(session) => session.step(now),
                None => return,
            }
        };
        match action {
            TickAction::Idle => {}
            TickAction::Retire(client) => {
                if let Some(mut client) = client {
                    client.channel_mut().disconnect();
                }
                let mut st = lock(&self.state);
                if st.sessions.get(&module).is_some_and(|s| !s.is_active()) {
                    st.sessions.remove(&module);
                    log::info!("module 0x{module:02X} session deleted");
                }
            }
            TickAction::KeepAlive(mut client) => {
                if let Err(e) = client.channel_mut().keep_alive() {
                    log::warn!("module 0x{module:02X} keep-alive failed: {e}");
                }
                self.give_back(module, client);
            }
            TickAction::Connect(client) => self.connect(module, client),
            TickAction::Poll(client, group) => self.poll(module, client, group),
        }
    }

    /// Brings the channel up: TP2.0 setup followed by the diagnostic
    /// session start
    fn connect(&mut self, module: u8, client: Option<KwpClient>) {
        let mut client = match client {
            Some(client) => client,
            None => {
                let tester_id = lock(&self.state)
                    .sessions
                    .get(&module)
                    .map(|s| s.tester_id())
                    .unwrap_or(DEFAULT_TESTER_ID);
                match self.interface.open_channel() {
                    Ok(io) => KwpClient::new(Tp20Channel::new(io, module, tester_id)),
                    Err(e) => {
                        log::error!("module 0x{module:02X}: opening CAN handle failed: {e}");
                        std::thread::sleep(RECOVERY_SLEEP);
                        return;
                    }
                }
            }
        };
        let res = client
            .channel_mut()
            .connect()
            .and_then(|()| client.start_diagnostic_session(kwp2000::DEFAULT_SESSION));
        let ok = match res {
            Ok(()) => {
                let _ = client.channel_mut().keep_alive();
                log::info!("module 0x{module:02X} connected");
                true
            }
            Err(e) => {
                log::error!("module 0x{module:02X} connect failed: {e}");
                client.channel_mut().disconnect();
                false
            }
        };
        let mut st = lock(&self.state);
        if let Some(session) = st.sessions.get_mut(&module) {
            session.apply_connect(client, ok);
        }
    }

    /// Reads one measuring block, publishes the decoded sample and applies
    /// the outcome to the session's error ladders
    fn poll(&mut self, module: u8, mut client: KwpClient, group: u8) {
        let now = Instant::now();
        let outcome = match client.read_measuring_block(group) {
            Ok(body) => {
                let sample = Sample {
                    module,
                    group,
                    data: measure::decode_block(&body),
                };
                if let Err(e) = self.publisher.publish(&sample) {
                    log::warn!("sample for 0x{module:02X}/{group} not published: {e}");
                }
                PollOutcome::Success
            }
            Err(DiagError::EcuError { nrc, def, .. }) => {
                log::warn!("module 0x{module:02X} group {group} rejected: NRC 0x{nrc:02X} ({def})");
                PollOutcome::Negative
            }
            Err(e) => {
                log::error!("module 0x{module:02X} group {group} read failed: {e}");
                PollOutcome::Failed
            }
        };
        let after = {
            let mut st = lock(&self.state);
            match st.sessions.get_mut(&module) {
                Some(session) => session.apply_poll(group, outcome, now),
                None => AfterPoll::KeepAlive,
            }
        };
        match after {
            AfterPoll::KeepAlive => {
                if client.channel().is_connected() {
                    if let Err(e) = client.channel_mut().keep_alive() {
                        log::warn!("module 0x{module:02X} keep-alive failed: {e}");
                    }
                }
            }
            AfterPoll::Reconnect => client.channel_mut().disconnect(),
        }
        self.give_back(module, client);
    }

    /// Disconnects every connected channel while preserving subscriptions
    /// (ignition off, TOGGLE off, shutdown)
    fn disconnect_all(&mut self) {
        let modules: Vec<u8> = lock(&self.state).sessions.keys().copied().collect();
        for module in modules {
            let client = {
                let mut st = lock(&self.state);
                st.sessions.get_mut(&module).and_then(|s| s.take_client())
            };
            if let Some(mut client) = client {
                if client.channel().is_connected() {
                    client.channel_mut().disconnect();
                    log::info!("module 0x{module:02X} disconnected (polling disabled)");
                }
                self.give_back(module, client);
            }
        }
    }

    fn give_back(&mut self, module: u8, mut client: KwpClient) {
        let mut st = lock(&self.state);
        if let Some(session) = st.sessions.get_mut(&module) {
            session.give_back(client);
        } else {
            // session vanished while its handle was out; close the orphan
            drop(st);
            client.channel_mut().disconnect();
        }
    }
}
