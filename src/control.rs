//! JSON command surface
//!
//! A request/reply endpoint lets other head-unit processes manage
//! subscriptions at runtime. Commands are JSON objects tagged by `cmd`;
//! the command set is closed and unknown or malformed input is rejected
//! with `{"status": "error"}`. Every command is applied under the state
//! lock in one piece, and a reply is always produced within the handler
//! turn.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::bus::ControlEndpoint;
use crate::scheduler::{SharedState, lock};

/// How long one receive poll blocks before the shutdown flag is rechecked
const RECV_POLL: Duration = Duration::from_millis(500);

/// The closed command set
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Snapshot of the gateway state
    #[serde(rename = "STATUS")]
    Status,
    /// Subscribe `module`/`group` (reference counted)
    #[serde(rename = "ADD")]
    Add {
        /// Target module address
        module: u8,
        /// Measuring-block group
        group: u8,
    },
    /// Drop one reference to `module`/`group`
    #[serde(rename = "REMOVE")]
    Remove {
        /// Target module address
        module: u8,
        /// Measuring-block group
        group: u8,
    },
    /// Replace one client's desired group set for a module
    #[serde(rename = "SYNC")]
    Sync {
        /// Target module address
        module: u8,
        /// Desired groups; an empty list drops the client's subscriptions
        groups: Vec<u8>,
        /// Identifies the requesting client across SYNCs
        client_id: String,
    },
    /// Flip the global enabled flag
    #[serde(rename = "TOGGLE")]
    Toggle,
    /// Tombstone every session
    #[serde(rename = "CLEAR")]
    Clear,
}

/// Parses and applies one raw request, returning the JSON reply
pub fn handle_request(state: &SharedState, raw: &str) -> String {
    let reply = match serde_json::from_str::<Command>(raw) {
        Ok(cmd) => apply(state, cmd),
        Err(e) => {
            log::warn!("rejected command {raw:?}: {e}");
            json!({"status": "error", "message": e.to_string()})
        }
    };
    reply.to_string()
}

/// Applies one command under the state lock
pub fn apply(state: &SharedState, cmd: Command) -> serde_json::Value {
    let mut st = lock(state);
    match cmd {
        Command::Status => {
            let mut sessions: Vec<_> = st
                .sessions
                .values()
                .map(|s| {
                    json!({
                        "module": s.module(),
                        "connected": s.is_connected(),
                        "active": s.is_active(),
                        "groups": s.groups(),
                    })
                })
                .collect();
            sessions.sort_by_key(|s| s["module"].as_u64());
            json!({
                "status": "ok",
                "enabled": st.enabled,
                "session_count": sessions.len(),
                "sessions": sessions,
            })
        }
        Command::Add { module, group } => {
            let count = st.session_entry(module).add(group);
            log::info!("(cmd) module 0x{module:02X} group {group} refcount -> {count}");
            json!({"status": "ok", "count": count})
        }
        Command::Remove { module, group } => match st.sessions.get_mut(&module) {
            Some(session) => match session.remove(group) {
                Some(count) => {
                    log::info!("(cmd) module 0x{module:02X} group {group} refcount -> {count}");
                    json!({"status": "ok", "count": count})
                }
                None => json!({"status": "warning", "message": "group not subscribed"}),
            },
            None => json!({"status": "error", "message": "module not active"}),
        },
        Command::Sync {
            module,
            groups,
            client_id,
        } => {
            st.session_entry(module).sync(&client_id, &groups);
            log::info!("(cmd) module 0x{module:02X} synced to {groups:?} for {client_id}");
            json!({"status": "ok"})
        }
        Command::Toggle => {
            st.enabled = !st.enabled;
            log::info!(
                "(cmd) polling {}",
                if st.enabled { "enabled" } else { "disabled" }
            );
            json!({"status": "ok", "enabled": st.enabled})
        }
        Command::Clear => {
            for session in st.sessions.values_mut() {
                session.mark_inactive();
            }
            log::info!("(cmd) all sessions marked inactive");
            json!({"status": "ok"})
        }
    }
}

/// Control worker: serves requests until the shutdown flag is raised.
///
/// The endpoint blocks on receive only; each command holds the state mutex
/// for the duration of its application and nothing else.
pub fn serve(state: SharedState, mut endpoint: Box<dyn ControlEndpoint>, shutdown: Arc<AtomicBool>) {
    log::info!("command worker started");
    while !shutdown.load(Ordering::Relaxed) {
        let request = match endpoint.recv_request(RECV_POLL) {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                log::error!("command receive failed: {e}");
                std::thread::sleep(RECV_POLL);
                continue;
            }
        };
        let reply = handle_request(&state, &request);
        if let Err(e) = endpoint.send_reply(&reply) {
            log::error!("command reply not delivered: {e}");
        }
    }
    log::info!("command worker stopped");
}
