//! Bounded mapping of device id to live session; the hub-facing entry
//! point for dispatch, registration and health.
//!
//! The map sits behind one mutex, locked only for add/remove/lookup.
//! Dispatch clones the session's queue handle under the lock and awaits
//! outside it, so a slow box never holds the registry. Each session runs
//! as its own task; removal aborts the task, which cancels any in-flight
//! command wait and drops the socket.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::skyq::commands::LogicalCommand;
use crate::skyq::info::InfoClient;
use crate::skyq::session::{DeviceSession, SessionCommand, SessionStatus};
use crate::skyq::{DeviceEndpoint, DeviceError};

pub const MAX_DEVICES: usize = 10;
const COMMAND_QUEUE_DEPTH: usize = 16;

struct SessionHandle {
    endpoint: DeviceEndpoint,
    cmd_tx: mpsc::Sender<SessionCommand>,
    status_rx: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

pub struct DeviceRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    info: InfoClient,
    poll_interval: Duration,
}

impl DeviceRegistry {
    pub fn new(poll_interval: Duration) -> Result<Self, DeviceError> {
        Ok(Self {
            sessions: Mutex::new(HashMap::new()),
            info: InfoClient::new()?,
            poll_interval,
        })
    }

    /// Register a box and start its session task.
    pub fn add(&self, endpoint: DeviceEndpoint) -> Result<String, DeviceError> {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        if sessions.contains_key(&endpoint.id) {
            return Err(DeviceError::DuplicateEndpoint(endpoint.id.clone()));
        }
        if sessions
            .values()
            .any(|h| h.endpoint.host == endpoint.host && h.endpoint.tcp_port == endpoint.tcp_port)
        {
            return Err(DeviceError::DuplicateEndpoint(endpoint.control_addr()));
        }
        if sessions.len() >= MAX_DEVICES {
            return Err(DeviceError::CapacityExceeded(MAX_DEVICES));
        }

        let (session, status_rx) =
            DeviceSession::new(endpoint.clone(), self.info.clone(), self.poll_interval);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let task = tokio::spawn(session.run(cmd_rx));

        let id = endpoint.id.clone();
        info!("registered device {} at {}", id, endpoint.control_addr());
        sessions.insert(
            id.clone(),
            SessionHandle {
                endpoint,
                cmd_tx,
                status_rx,
                task,
            },
        );
        Ok(id)
    }

    /// Tear down and forget a device: cancels any in-flight command wait
    /// and releases its socket. No-op for unknown ids.
    pub fn remove(&self, device_id: &str) {
        let handle = self
            .sessions
            .lock()
            .expect("registry lock poisoned")
            .remove(device_id);
        if let Some(handle) = handle {
            handle.task.abort();
            info!("removed device {}", device_id);
        }
    }

    /// Forward a logical command to the device's session and wait for the
    /// acknowledgement or error.
    pub async fn dispatch(
        &self,
        device_id: &str,
        command: LogicalCommand,
    ) -> Result<(), DeviceError> {
        let cmd_tx = {
            let sessions = self.sessions.lock().expect("registry lock poisoned");
            sessions
                .get(device_id)
                .ok_or_else(|| DeviceError::UnknownDevice(device_id.to_string()))?
                .cmd_tx
                .clone()
        };

        let (reply, reply_rx) = oneshot::channel();
        cmd_tx
            .send(SessionCommand { command, reply })
            .await
            .map_err(|_| DeviceError::UnknownDevice(device_id.to_string()))?;
        reply_rx.await.map_err(|_| {
            DeviceError::ChannelBroken("session removed while command was in flight".into())
        })?
    }

    /// Read-only view of every session's state, identity and timings.
    pub fn health_snapshot(&self) -> HashMap<String, SessionStatus> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .map(|(id, handle)| (id.clone(), handle.status_rx.borrow().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every session. Used on process shutdown.
    pub fn shutdown(&self) {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        for (id, handle) in sessions.drain() {
            handle.task.abort();
            info!("stopped session for {}", id);
        }
    }
}
