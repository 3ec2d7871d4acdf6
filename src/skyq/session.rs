//! Per-device state machine: one task per box combining the control
//! channel with periodic identity/power refresh, plus reconnect policy.
//!
//! The task owns all mutable session state. Commands arrive over a bounded
//! mpsc queue with a oneshot reply each; queue order is submission order
//! and the task handles one command at a time, which is what keeps frames
//! on the channel strictly paired. While the device is down the task
//! answers queued commands with `NotConnected` instead of blocking.

use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::channel::RemoteChannel;
use super::commands::{self, LogicalCommand};
use super::info::InfoClient;
use super::{ConnectionState, DeviceEndpoint, DeviceError, DeviceIdentity, PowerState};

/// Immediate open attempts per connect cycle before parking in `Failed`
/// until the next poll-cadence retry.
const CONNECT_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const BACKOFF_JITTER_MS: u64 = 250;

/// One queued command and its reply slot.
pub struct SessionCommand {
    pub command: LogicalCommand,
    pub reply: oneshot::Sender<Result<(), DeviceError>>,
}

/// Read-only view of a session, published over a watch channel on every
/// change. The registry's health snapshot is built from these.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub identity: Option<DeviceIdentity>,
    pub power: PowerState,
    pub last_success: Option<SystemTime>,
    pub consecutive_failures: u32,
}

impl SessionStatus {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            identity: None,
            power: PowerState::Unknown,
            last_success: None,
            consecutive_failures: 0,
        }
    }
}

/// Deterministic part of the reconnect delay; jitter is added at the
/// sleep site.
fn backoff_delay(consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(5);
    (BACKOFF_BASE * 2u32.pow(exp)).min(BACKOFF_CAP)
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS))
}

enum Exit {
    /// Registry dropped the command channel; tear the session down.
    Teardown,
    /// Transport failure; reconnect with backoff.
    ChannelLost,
}

pub struct DeviceSession {
    endpoint: DeviceEndpoint,
    info: InfoClient,
    poll_interval: Duration,
    status_tx: watch::Sender<SessionStatus>,
    status: SessionStatus,
}

impl DeviceSession {
    pub fn new(
        endpoint: DeviceEndpoint,
        info: InfoClient,
        poll_interval: Duration,
    ) -> (Self, watch::Receiver<SessionStatus>) {
        let status = SessionStatus::initial();
        let (status_tx, status_rx) = watch::channel(status.clone());
        (
            Self {
                endpoint,
                info,
                poll_interval,
                status_tx,
                status,
            },
            status_rx,
        )
    }

    fn publish(&self) {
        let _ = self.status_tx.send(self.status.clone());
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.status.state != state {
            debug!("device {}: {} -> {}", self.endpoint.id, self.status.state, state);
            self.status.state = state;
        }
        self.publish();
    }

    /// Session main loop. Runs until the registry drops the command
    /// channel (or aborts the task outright on removal).
    pub async fn run(mut self, mut cmd_rx: mpsc::Receiver<SessionCommand>) {
        info!(
            "session for {} ({}) started",
            self.endpoint.id,
            self.endpoint.control_addr()
        );
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.connect().await {
                Ok(mut chan) => {
                    self.status.consecutive_failures = 0;
                    self.status.last_success = Some(SystemTime::now());
                    // Advisory: a box with a broken info endpoint can
                    // still be commanded.
                    self.refresh().await;
                    self.set_state(ConnectionState::Connected);
                    info!("device {} connected", self.endpoint.id);

                    let exit = self.run_connected(&mut chan, &mut cmd_rx).await;
                    chan.close().await;
                    match exit {
                        Exit::Teardown => break,
                        Exit::ChannelLost => {
                            self.status.consecutive_failures += 1;
                            self.set_state(ConnectionState::Reconnecting);
                            let delay =
                                backoff_delay(self.status.consecutive_failures) + jitter();
                            warn!(
                                "device {}: channel lost, reconnecting in {:?}",
                                self.endpoint.id, delay
                            );
                            if !self.idle_wait(&mut cmd_rx, delay).await {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.status.consecutive_failures += 1;
                    self.set_state(ConnectionState::Failed);
                    warn!(
                        "device {} unreachable: {} (next attempt in {:?})",
                        self.endpoint.id, e, self.poll_interval
                    );
                    if !self.idle_wait(&mut cmd_rx, self.poll_interval).await {
                        break;
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("session for {} ended", self.endpoint.id);
    }

    async fn connect(&mut self) -> Result<RemoteChannel, DeviceError> {
        let mut last = DeviceError::NotConnected;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match RemoteChannel::open(&self.endpoint).await {
                Ok(chan) => return Ok(chan),
                Err(e) => {
                    debug!(
                        "device {}: open attempt {attempt}/{CONNECT_ATTEMPTS} failed: {e}",
                        self.endpoint.id
                    );
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Identity and power refresh over HTTP. Failures are logged and
    /// retried on the next poll cycle, never propagated.
    async fn refresh(&mut self) {
        match self.info.fetch_identity(&self.endpoint).await {
            Ok(identity) => self.status.identity = Some(identity),
            Err(e) => debug!("device {}: identity fetch failed: {}", self.endpoint.id, e),
        }
        self.status.power = self.info.fetch_power_state(&self.endpoint).await;
        self.publish();
    }

    async fn run_connected(
        &mut self,
        chan: &mut RemoteChannel,
        cmd_rx: &mut mpsc::Receiver<SessionCommand>,
    ) -> Exit {
        let mut poll = tokio::time::interval(self.poll_interval);
        // Identity was just fetched during connect; skip the immediate tick.
        poll.tick().await;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(SessionCommand { command, reply }) = cmd else {
                        return Exit::Teardown;
                    };
                    match self.send_one(chan, command).await {
                        Ok(()) => {
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            let lost = e.is_transport();
                            let _ = reply.send(Err(e));
                            if lost {
                                return Exit::ChannelLost;
                            }
                        }
                    }
                }
                _ = poll.tick() => self.refresh().await,
            }
        }
    }

    async fn send_one(
        &mut self,
        chan: &mut RemoteChannel,
        command: LogicalCommand,
    ) -> Result<(), DeviceError> {
        // Decided before any network I/O.
        if let Some(DeviceIdentity { capabilities, .. }) = &self.status.identity {
            if !capabilities.supports(command) {
                return Err(DeviceError::UnsupportedCommand(command));
            }
        }
        let code = commands::resolve(command)?;

        self.set_state(ConnectionState::SendingCommand);
        match chan.send(code).await {
            Ok(()) => {
                debug!("device {}: {} acknowledged", self.endpoint.id, command);
                self.status.last_success = Some(SystemTime::now());
                self.status.consecutive_failures = 0;
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            // Caller flips the state to Reconnecting.
            Err(e) => Err(e),
        }
    }

    /// Park between attempts: keep the identity/power poll running on its
    /// cadence and answer queued commands with `NotConnected` until the
    /// delay elapses. Returns false once the registry has dropped the
    /// command channel.
    async fn idle_wait(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<SessionCommand>,
        delay: Duration,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        // A box whose control port is down can still have a live REST
        // service; the first tick fires immediately.
        let mut poll = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = poll.tick() => self.refresh().await,
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand { reply, .. }) => {
                        let _ = reply.send(Err(DeviceError::NotConnected));
                    }
                    None => return false,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skyq::testutil::{mock_box, mock_box_on, mock_info_endpoint};
    use tokio::net::TcpListener;

    fn endpoint(tcp_port: u16) -> DeviceEndpoint {
        DeviceEndpoint {
            id: "d1".into(),
            name: "Living Room".into(),
            host: "127.0.0.1".into(),
            // Nothing listens here; identity stays advisory-empty.
            http_port: 1,
            tcp_port,
        }
    }

    fn spawn_session(
        tcp_port: u16,
        poll_interval: Duration,
    ) -> (mpsc::Sender<SessionCommand>, watch::Receiver<SessionStatus>) {
        let (session, status_rx) = DeviceSession::new(
            endpoint(tcp_port),
            InfoClient::new().unwrap(),
            poll_interval,
        );
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        tokio::spawn(session.run(cmd_rx));
        (cmd_tx, status_rx)
    }

    async fn send(
        cmd_tx: &mpsc::Sender<SessionCommand>,
        command: LogicalCommand,
    ) -> Result<(), DeviceError> {
        let (reply, rx) = oneshot::channel();
        cmd_tx
            .send(SessionCommand { command, reply })
            .await
            .expect("session gone");
        rx.await.expect("reply dropped")
    }

    async fn wait_for_state(
        status_rx: &watch::Receiver<SessionStatus>,
        wanted: ConnectionState,
        within: Duration,
    ) {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if status_rx.borrow().state == wanted {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "state never became {wanted}, last was {}",
                status_rx.borrow().state
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn backoff_is_monotone_and_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        let mut previous = Duration::ZERO;
        for failures in 1..20 {
            let delay = backoff_delay(failures);
            assert!(delay >= previous);
            assert!(delay <= BACKOFF_CAP);
            previous = delay;
        }
        assert_eq!(backoff_delay(19), BACKOFF_CAP);
    }

    #[tokio::test]
    async fn connects_and_acknowledges_commands() {
        let device = mock_box(Duration::ZERO).await;
        let (cmd_tx, status_rx) = spawn_session(device.addr.port(), Duration::from_secs(30));

        wait_for_state(&status_rx, ConnectionState::Connected, Duration::from_secs(2)).await;
        send(&cmd_tx, LogicalCommand::Select).await.unwrap();
        assert_eq!(device.received_codes(), vec![1]);

        let status = status_rx.borrow().clone();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_success.is_some());
    }

    #[tokio::test]
    async fn unsupported_command_does_no_io() {
        let device = mock_box(Duration::ZERO).await;
        let (cmd_tx, status_rx) = spawn_session(device.addr.port(), Duration::from_secs(30));
        wait_for_state(&status_rx, ConnectionState::Connected, Duration::from_secs(2)).await;

        match send(&cmd_tx, LogicalCommand::VolumeUp).await {
            Err(DeviceError::UnsupportedCommand(LogicalCommand::VolumeUp)) => {}
            other => panic!("expected UnsupportedCommand, got {other:?}"),
        }
        assert!(device.received_codes().is_empty());
        assert_eq!(status_rx.borrow().state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn down_device_answers_not_connected_and_self_heals() {
        // Reserve a port with nothing behind it, so opens fail fast.
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = placeholder.local_addr().unwrap().port();
        drop(placeholder);

        let (cmd_tx, status_rx) = spawn_session(port, Duration::from_millis(150));
        wait_for_state(&status_rx, ConnectionState::Failed, Duration::from_secs(2)).await;
        assert!(status_rx.borrow().consecutive_failures > 0);

        match send(&cmd_tx, LogicalCommand::Select).await {
            Err(DeviceError::NotConnected) => {}
            other => panic!("expected NotConnected, got {other:?}"),
        }

        // The box comes back on the same port; the poll cadence picks it up.
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let device = mock_box_on(listener, Duration::ZERO);
        wait_for_state(&status_rx, ConnectionState::Connected, Duration::from_secs(5)).await;

        send(&cmd_tx, LogicalCommand::Select).await.unwrap();
        assert_eq!(device.received_codes(), vec![1]);
        assert_eq!(status_rx.borrow().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn unreachable_box_still_polls_power_over_http() {
        // REST service is alive and reports standby, control port closed.
        let http = mock_info_endpoint("ES130", "ABC123", true).await;
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_port = placeholder.local_addr().unwrap().port();
        drop(placeholder);

        let (session, status_rx) = DeviceSession::new(
            DeviceEndpoint {
                id: "d1".into(),
                name: "Living Room".into(),
                host: "127.0.0.1".into(),
                http_port: http.port(),
                tcp_port,
            },
            InfoClient::new().unwrap(),
            Duration::from_millis(100),
        );
        let (_cmd_tx, cmd_rx) = mpsc::channel(16);
        tokio::spawn(session.run(cmd_rx));

        wait_for_state(&status_rx, ConnectionState::Failed, Duration::from_secs(2)).await;

        // The parked session keeps polling; identity and power fill in
        // even though the control channel never comes up.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let status = status_rx.borrow().clone();
            if status.power == PowerState::Standby {
                let identity = status.identity.as_ref().expect("identity fetched over HTTP");
                assert_eq!(identity.model, "ES130");
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "power never refreshed while parked, last was {:?}",
                status.power
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn broken_channel_reconnects_and_resets_the_counter() {
        // First connection dies after one acknowledged command; later
        // connections behave normally.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut first = true;
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let die_after_one = first;
                first = false;
                tokio::spawn(async move {
                    sock.write_all(b"SKY 000.001\n").await?;
                    let mut echo = [0u8; 12];
                    sock.read_exact(&mut echo).await?;
                    sock.write_all(&[0u8; 24]).await?;
                    loop {
                        let mut frames = [0u8; 16];
                        sock.read_exact(&mut frames).await?;
                        sock.write_all(&frames).await?;
                        if die_after_one {
                            return std::io::Result::Ok(());
                        }
                    }
                });
            }
        });

        let (cmd_tx, status_rx) = spawn_session(addr.port(), Duration::from_secs(30));
        wait_for_state(&status_rx, ConnectionState::Connected, Duration::from_secs(2)).await;
        send(&cmd_tx, LogicalCommand::Play).await.unwrap();

        // The peer hung up; the next command surfaces the broken channel
        // and pushes the session into its reconnect path.
        match send(&cmd_tx, LogicalCommand::Pause).await {
            Err(DeviceError::ChannelBroken(_)) | Err(DeviceError::Timeout(_)) => {}
            other => panic!("expected a dead channel, got {other:?}"),
        }

        // Backoff for one failure is ~1s; the session then reconnects.
        wait_for_state(&status_rx, ConnectionState::Connected, Duration::from_secs(5)).await;
        send(&cmd_tx, LogicalCommand::Pause).await.unwrap();
        assert_eq!(status_rx.borrow().consecutive_failures, 0);
    }
}
