//! Per-ECU polling session
//!
//! A session tracks which measuring-block groups are subscribed for one
//! module, by whom, and how polling of each group is going. Subscriptions
//! are reference counted so several consumers can watch the same group; the
//! insertion-ordered group list drives round-robin polling with a cursor.
//!
//! Sessions never perform I/O themselves. Each tick, [Session::step] hands
//! the scheduler an intent (connect, poll one group, keep alive, retire)
//! together with the channel handle; the scheduler performs the bus dialogue
//! outside the state lock and folds the outcome back in through the
//! `apply_*` methods. Failure policy:
//! * three consecutive errors on one group suspend it for 30 s
//! * five consecutive transport errors force a channel re-setup
//! * a failed connect attempt is not retried for 5 s

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::kwp2000::KwpClient;

/// Minimum spacing between connect attempts
pub const RECONNECT_HOLDOFF: Duration = Duration::from_secs(5);
/// How long a misbehaving group is suspended
pub const GROUP_COOLDOWN: Duration = Duration::from_secs(30);
/// Consecutive failures before a group is suspended
pub const GROUP_ERROR_LIMIT: u32 = 3;
/// Consecutive transport failures before the channel is torn down
pub const SESSION_ERROR_LIMIT: u32 = 5;

/// What the scheduler should do for this session on the current tick
pub enum TickAction {
    /// Nothing to do
    Idle,
    /// Session is tombstoned: disconnect the channel (if any) and delete it
    Retire(Option<KwpClient>),
    /// No pollable group right now; keep the channel alive
    KeepAlive(KwpClient),
    /// Not connected and past the holdoff: (re)establish the channel.
    /// `None` means no CAN handle has been opened yet.
    Connect(Option<KwpClient>),
    /// Read one measuring block
    Poll(KwpClient, u8),
}

impl std::fmt::Debug for TickAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TickAction::Idle => write!(f, "Idle"),
            TickAction::Retire(_) => write!(f, "Retire"),
            TickAction::KeepAlive(_) => write!(f, "KeepAlive"),
            TickAction::Connect(_) => write!(f, "Connect"),
            TickAction::Poll(_, group) => write!(f, "Poll({group})"),
        }
    }
}

/// How a measuring-block poll ended
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Positive response, sample published
    Success,
    /// The ECU sent a KWP negative response
    Negative,
    /// Transport or protocol failure
    Failed,
}

/// Follow-up the scheduler owes the channel after applying a poll outcome
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AfterPoll {
    /// Send the per-tick keep-alive
    KeepAlive,
    /// Too many session errors: tear the channel down so the next tick
    /// re-establishes it
    Reconnect,
}

/// Subscription and polling state for one target module
pub struct Session {
    module: u8,
    tester_id: u16,
    client: Option<KwpClient>,
    refs: HashMap<u8, u32>,
    clients: HashMap<String, BTreeSet<u8>>,
    groups: Vec<u8>,
    cursor: usize,
    group_errors: HashMap<u8, u32>,
    cooldowns: HashMap<u8, Instant>,
    error_count: u32,
    active: bool,
    connected: bool,
    last_connect_attempt: Option<Instant>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("module", &self.module)
            .field("groups", &self.groups)
            .field("active", &self.active)
            .field("connected", &self.connected)
            .finish()
    }
}

impl Session {
    /// Creates an empty, active session for `module`, listening on
    /// `tester_id` once connected
    pub fn new(module: u8, tester_id: u16) -> Self {
        Self {
            module,
            tester_id,
            client: None,
            refs: HashMap::new(),
            clients: HashMap::new(),
            groups: Vec::new(),
            cursor: 0,
            group_errors: HashMap::new(),
            cooldowns: HashMap::new(),
            error_count: 0,
            active: true,
            connected: false,
            last_connect_attempt: None,
        }
    }

    /// Target module address
    pub fn module(&self) -> u8 {
        self.module
    }

    /// The tester id reserved for this session's channel
    pub fn tester_id(&self) -> u16 {
        self.tester_id
    }

    /// Subscribed groups in insertion order
    pub fn groups(&self) -> &[u8] {
        &self.groups
    }

    /// False once the session is tombstoned
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Mirror of the channel's connected flag
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// True when at least one group is subscribed
    pub fn has_pending(&self) -> bool {
        !self.groups.is_empty()
    }

    /// Increments the reference count for `group`, appending it to the poll
    /// rotation when it is new. Revives a tombstoned session. Returns the
    /// new count.
    pub fn add(&mut self, group: u8) -> u32 {
        self.active = true;
        let count = self.refs.entry(group).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.groups.push(group);
        }
        *count
    }

    /// Decrements the reference count for `group`, dropping it from the poll
    /// rotation at zero. A session whose last group goes away is marked
    /// inactive. Returns the remaining count, or `None` if the group was not
    /// subscribed.
    pub fn remove(&mut self, group: u8) -> Option<u32> {
        let count = self.refs.get_mut(&group)?;
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            self.refs.remove(&group);
            self.groups.retain(|&g| g != group);
            if self.cursor >= self.groups.len() {
                self.cursor = 0;
            }
        }
        if self.refs.is_empty() {
            self.active = false;
        }
        Some(remaining)
    }

    /// Replaces `client_id`'s desired group set, applying the delta through
    /// [Session::add] / [Session::remove] so subscriptions from other
    /// clients are unaffected. Syncing an empty set tombstones the session
    /// if nothing else holds a reference.
    pub fn sync(&mut self, client_id: &str, groups: &[u8]) {
        let desired: BTreeSet<u8> = groups.iter().copied().collect();
        let current = self.clients.remove(client_id).unwrap_or_default();
        for &g in desired.difference(&current) {
            self.add(g);
        }
        for &g in current.difference(&desired) {
            self.remove(g);
        }
        if !desired.is_empty() {
            self.clients.insert(client_id.to_string(), desired);
        } else if self.refs.is_empty() {
            self.active = false;
        }
    }

    /// Tombstones the session; it is torn down and deleted on its next visit
    pub fn mark_inactive(&mut self) {
        self.active = false;
    }

    /// Takes the channel handle out for I/O (ignition-off teardown)
    pub fn take_client(&mut self) -> Option<KwpClient> {
        self.client.take()
    }

    /// Returns the channel handle after I/O, refreshing the connected mirror
    pub fn give_back(&mut self, client: KwpClient) {
        self.connected = client.channel().is_connected();
        self.client = Some(client);
    }

    /// Decides this tick's action. Called under the state lock; any returned
    /// channel handle is owned by the scheduler until it is given back.
    pub fn step(&mut self, now: Instant) -> TickAction {
        if !self.active {
            return TickAction::Retire(self.client.take());
        }
        if self.connected && self.client.is_none() {
            self.connected = false;
        }
        if self.groups.is_empty() {
            if self.connected {
                if let Some(client) = self.client.take() {
                    return TickAction::KeepAlive(client);
                }
            }
            return TickAction::Idle;
        }
        if !self.connected {
            if let Some(last) = self.last_connect_attempt {
                if now.duration_since(last) < RECONNECT_HOLDOFF {
                    return TickAction::Idle;
                }
            }
            self.last_connect_attempt = Some(now);
            return TickAction::Connect(self.client.take());
        }
        if self.cursor >= self.groups.len() {
            self.cursor = 0;
        }
        for _ in 0..self.groups.len() {
            let group = self.groups[self.cursor];
            let cooling = self
                .cooldowns
                .get(&group)
                .is_some_and(|&until| now < until);
            if !cooling {
                return match self.client.take() {
                    Some(client) => TickAction::Poll(client, group),
                    None => {
                        self.connected = false;
                        TickAction::Idle
                    }
                };
            }
            self.cursor = (self.cursor + 1) % self.groups.len();
        }
        // every group is cooling down
        match self.client.take() {
            Some(client) => TickAction::KeepAlive(client),
            None => {
                self.connected = false;
                TickAction::Idle
            }
        }
    }

    /// Folds a connect attempt back in
    pub fn apply_connect(&mut self, client: KwpClient, ok: bool) {
        self.connected = ok && client.channel().is_connected();
        if self.connected {
            // a successful setup lifts the holdoff for the next reconnect
            self.last_connect_attempt = None;
            self.error_count = 0;
        }
        self.client = Some(client);
    }

    /// Folds a poll outcome back in: error ladders, cooldown bookkeeping and
    /// the cursor advance. Negative KWP responses count against the group
    /// only; transport failures also climb the session ladder that forces a
    /// reconnect.
    pub fn apply_poll(&mut self, group: u8, outcome: PollOutcome, now: Instant) -> AfterPoll {
        let mut after = AfterPoll::KeepAlive;
        match outcome {
            PollOutcome::Success => {
                self.group_errors.insert(group, 0);
                self.error_count = 0;
            }
            PollOutcome::Negative | PollOutcome::Failed => {
                let errors = self.group_errors.entry(group).or_insert(0);
                *errors += 1;
                if *errors >= GROUP_ERROR_LIMIT {
                    log::warn!(
                        "module 0x{:02X} group {group} failed {GROUP_ERROR_LIMIT} times, suspending for {}s",
                        self.module,
                        GROUP_COOLDOWN.as_secs()
                    );
                    self.cooldowns.insert(group, now + GROUP_COOLDOWN);
                    *errors = 0;
                }
                if outcome == PollOutcome::Failed {
                    self.error_count += 1;
                    if self.error_count >= SESSION_ERROR_LIMIT {
                        log::error!(
                            "module 0x{:02X}: too many session errors, forcing reconnect",
                            self.module
                        );
                        self.error_count = 0;
                        after = AfterPoll::Reconnect;
                    }
                }
            }
        }
        if self.groups.is_empty() {
            self.cursor = 0;
        } else {
            self.cursor = (self.cursor + 1) % self.groups.len();
        }
        after
    }
}
