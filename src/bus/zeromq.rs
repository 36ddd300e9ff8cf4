//! ZeroMQ fabric backend
//!
//! Socket layout matches the rest of the head unit: a PUB socket bound to
//! the stream endpoint (multipart: topic frame, JSON frame), a REP socket
//! bound to the command endpoint, and a SUB socket connected to the
//! system-events publisher, subscribed to `POWER_STATUS`.

use std::time::Duration;

use serde::Deserialize;

use super::{BusError, ControlEndpoint, DIAG_TOPIC, POWER_TOPIC, Sample, SamplePublisher, SystemEvents};
use crate::{DiagError, DiagResult};

fn endpoint_err(what: &str, e: zmq::Error) -> BusError {
    BusError::Endpoint(format!("{what}: {e}"))
}

/// PUB socket for the outbound sample stream
pub struct ZmqPublisher {
    socket: zmq::Socket,
}

impl ZmqPublisher {
    /// Binds the stream endpoint
    pub fn bind(context: &zmq::Context, addr: &str) -> Result<Self, BusError> {
        let socket = context.socket(zmq::PUB).map_err(|e| endpoint_err("PUB", e))?;
        socket
            .bind(addr)
            .map_err(|e| endpoint_err(&format!("bind {addr}"), e))?;
        log::info!("publishing diagnostics stream on {addr}");
        Ok(Self { socket })
    }
}

impl std::fmt::Debug for ZmqPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZmqPublisher").finish()
    }
}

impl SamplePublisher for ZmqPublisher {
    fn publish(&mut self, sample: &Sample) -> Result<(), BusError> {
        let payload =
            serde_json::to_vec(sample).map_err(|e| BusError::Endpoint(e.to_string()))?;
        self.socket
            .send_multipart([DIAG_TOPIC.as_bytes().to_vec(), payload], 0)
            .map_err(|e| endpoint_err("publish", e))
    }
}

/// REP socket serving the command surface
pub struct ZmqControlEndpoint {
    socket: zmq::Socket,
}

impl ZmqControlEndpoint {
    /// Binds the command endpoint
    pub fn bind(context: &zmq::Context, addr: &str) -> Result<Self, BusError> {
        let socket = context.socket(zmq::REP).map_err(|e| endpoint_err("REP", e))?;
        socket
            .bind(addr)
            .map_err(|e| endpoint_err(&format!("bind {addr}"), e))?;
        log::info!("command endpoint on {addr}");
        Ok(Self { socket })
    }
}

impl std::fmt::Debug for ZmqControlEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZmqControlEndpoint").finish()
    }
}

impl ControlEndpoint for ZmqControlEndpoint {
    fn recv_request(&mut self, timeout: Duration) -> DiagResult<Option<String>> {
        let events = self
            .socket
            .poll(zmq::POLLIN, timeout.as_millis() as i64)
            .map_err(|e| endpoint_err("poll", e))?;
        if events == 0 {
            return Ok(None);
        }
        match self.socket.recv_string(0) {
            Ok(Ok(raw)) => Ok(Some(raw)),
            // non-UTF8 requests still deserve an error reply
            Ok(Err(bytes)) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) => Err(endpoint_err("recv", e).into()),
        }
    }

    fn send_reply(&mut self, reply: &str) -> DiagResult<()> {
        match self.socket.send(reply.as_bytes(), zmq::DONTWAIT) {
            Ok(()) => Ok(()),
            Err(zmq::Error::EAGAIN) => Err(DiagError::BusBusy),
            Err(e) => Err(endpoint_err("reply", e).into()),
        }
    }
}

/// SUB socket draining `POWER_STATUS` events
pub struct ZmqSystemEvents {
    socket: zmq::Socket,
}

impl ZmqSystemEvents {
    /// Connects to the system-events publisher
    pub fn connect(context: &zmq::Context, addr: &str) -> Result<Self, BusError> {
        let socket = context.socket(zmq::SUB).map_err(|e| endpoint_err("SUB", e))?;
        socket
            .connect(addr)
            .map_err(|e| endpoint_err(&format!("connect {addr}"), e))?;
        socket
            .set_subscribe(POWER_TOPIC.as_bytes())
            .map_err(|e| endpoint_err("subscribe", e))?;
        log::info!("monitoring ignition at {addr}");
        Ok(Self { socket })
    }
}

impl std::fmt::Debug for ZmqSystemEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZmqSystemEvents").finish()
    }
}

#[derive(Debug, Deserialize)]
struct PowerStatus {
    #[serde(default)]
    kl15: bool,
}

impl SystemEvents for ZmqSystemEvents {
    fn poll_ignition(&mut self) -> Option<bool> {
        loop {
            let parts = match self.socket.recv_multipart(zmq::DONTWAIT) {
                Ok(parts) => parts,
                Err(zmq::Error::EAGAIN) => return None,
                Err(e) => {
                    log::error!("ignition monitor receive failed: {e}");
                    return None;
                }
            };
            let [topic, payload] = parts.as_slice() else {
                continue;
            };
            if topic.as_slice() != POWER_TOPIC.as_bytes() {
                continue;
            }
            match serde_json::from_slice::<PowerStatus>(payload) {
                Ok(status) => return Some(status.kl15),
                Err(e) => log::warn!("malformed POWER_STATUS event: {e}"),
            }
        }
    }
}
