//! Connection handle
//!
//! A [`Connection`] owns one transport and supervises it:
//! - one physical operation at a time, enforced by a lock that reports
//!   [`ConcurrencyError`] instead of queuing
//! - lifecycle through [`ConnectionStateMachine`]
//! - automatic reconnection with exponential backoff after link failures,
//!   suppressed while the operator has disconnected manually
//!
//! The handle is cheap to clone; clones share the same link.

use super::error::{ConcurrencyError, ConnectionError, Error, Result, TimeoutError};
use super::frame::CanFrame;
use super::state_machine::{
    BackoffPolicy, ConnectionState, ConnectionStateMachine, ReconnectState, StateTransition,
};
use super::transport::{AdapterConfig, AdapterInfo, AdapterKind, SerialTransport, Transport, TransportStats};
use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Adapter port, baud rate, bitrate and per-operation timeout
    pub adapter: AdapterConfig,
    /// Reconnect automatically after link failures
    pub auto_reconnect: bool,
    /// Delay growth between automatic attempts
    pub backoff: BackoffPolicy,
}

impl ConnectionConfig {
    /// Create a configuration with automatic reconnection enabled
    pub fn new(adapter: AdapterConfig) -> Self {
        Self {
            adapter,
            auto_reconnect: true,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Enable or disable automatic reconnection
    #[must_use]
    pub fn auto_reconnect(mut self, enable: bool) -> Self {
        self.auto_reconnect = enable;
        self
    }

    /// Set the backoff policy
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

struct ReconnectTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ConnectionConfig,
    kind: AdapterKind,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    machine: Mutex<ConnectionStateMachine>,
    reconnect: Mutex<ReconnectState>,
    reconnect_task: Mutex<Option<ReconnectTask>>,
    adapter_info: RwLock<Option<AdapterInfo>>,
    state_tx: watch::Sender<ConnectionState>,
    frame_tx: broadcast::Sender<CanFrame>,
}

/// Supervised link to the CAN adapter
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Open a serial adapter with default reconnection settings
    pub async fn connect(port: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let adapter = AdapterConfig::new(port, baud_rate).timeout(timeout);
        Self::connect_with_config(ConnectionConfig::new(adapter)).await
    }

    /// Open a serial adapter with full configuration
    pub async fn connect_with_config(config: ConnectionConfig) -> Result<Self> {
        let transport = SerialTransport::new(config.adapter.clone());
        Self::with_transport(Box::new(transport), config).await
    }

    /// Open an arbitrary transport
    pub async fn with_transport(transport: Box<dyn Transport>, config: ConnectionConfig) -> Result<Self> {
        let conn = Self::new(transport, config);
        conn.manual_connect().await?;
        Ok(conn)
    }

    /// Wrap a transport without opening it
    pub fn new(transport: Box<dyn Transport>, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let (frame_tx, _) = broadcast::channel(1024);
        let kind = transport.kind();
        let reconnect = ReconnectState::new(config.backoff);

        Self {
            inner: Arc::new(Inner {
                config,
                kind,
                transport: tokio::sync::Mutex::new(transport),
                machine: Mutex::new(ConnectionStateMachine::new()),
                reconnect: Mutex::new(reconnect),
                reconnect_task: Mutex::new(None),
                adapter_info: RwLock::new(None),
                state_tx,
                frame_tx,
            }),
        }
    }

    /// Take exclusive use of the link.
    ///
    /// Fails with [`ConcurrencyError`] while another operation (including a
    /// reconnection attempt) holds it.
    pub fn lock(&self) -> std::result::Result<LinkGuard<'_>, ConcurrencyError> {
        let transport = self.inner.transport.try_lock().map_err(|_| ConcurrencyError)?;
        Ok(LinkGuard { conn: self, transport })
    }

    /// Send one frame with the default timeout
    pub async fn send(&self, frame: &CanFrame) -> Result<()> {
        self.lock()?.send(frame).await
    }

    /// Receive one frame, `None` on timeout
    pub async fn receive(&self, timeout: Duration) -> Result<Option<CanFrame>> {
        self.lock()?.receive(timeout).await
    }

    /// Send a request and wait for the frame with `response_id`
    pub async fn request(&self, request: &CanFrame, response_id: u32, timeout: Duration) -> Result<CanFrame> {
        self.lock()?.request(request, response_id, timeout).await
    }

    /// Stop all traffic and keep the link down until [`Self::manual_connect`].
    ///
    /// Any pending reconnection is cancelled before this returns. Waits for
    /// an in-flight operation to finish, then closes the transport.
    pub async fn manual_disconnect(&self) {
        self.inner.reconnect.lock().set_manual_disconnect();
        self.cancel_reconnect().await;

        let mut transport = self.inner.transport.lock().await;
        match self.state() {
            ConnectionState::Closed => {
                let _ = transport.close().await;
                return;
            }
            // reconnection aborted mid-open
            ConnectionState::Connecting => {
                let _ = transport.close().await;
                self.set_state(ConnectionState::Closed, Some("manual disconnect"));
                info!(port = %self.port(), "manually disconnected during reconnection");
                return;
            }
            _ => {}
        }

        self.set_state(ConnectionState::Closing, Some("manual disconnect"));
        if let Err(e) = transport.close().await {
            debug!(error = %e, "close during manual disconnect failed");
        }
        self.set_state(ConnectionState::Closed, Some("manual disconnect"));
        info!(port = %self.port(), "manually disconnected");
    }

    /// Clear the manual-disconnect flag and connect immediately.
    ///
    /// The backoff delay is reset. Errors are returned to the caller, e.g.
    /// [`ConnectionError::PermissionDenied`] when another process holds the
    /// port. A failed manual connect does not start automatic reconnection.
    pub async fn manual_connect(&self) -> Result<()> {
        self.inner.reconnect.lock().manual_connect();
        self.cancel_reconnect().await;

        let mut transport = self.inner.transport.try_lock().map_err(|_| ConcurrencyError)?;
        if self.state() == ConnectionState::Connected && transport.is_open() {
            return Ok(());
        }
        self.open_link(&mut transport).await.map(|_| ())
    }

    async fn cancel_reconnect(&self) {
        let task = self.inner.reconnect_task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            task.handle.abort();
            let _ = task.handle.await;
            debug!("reconnection task cancelled");
        }
    }

    async fn open_link(&self, transport: &mut Box<dyn Transport>) -> Result<AdapterInfo> {
        self.set_state(ConnectionState::Connecting, None);
        match transport.open().await {
            Ok(adapter) => {
                *self.inner.adapter_info.write() = Some(adapter.clone());
                self.inner.reconnect.lock().reset();
                self.set_state(ConnectionState::Connected, None);
                info!(link = %transport.describe(), adapter = %adapter, "connected");
                Ok(adapter)
            }
            Err(e) => {
                let _ = transport.close().await;
                self.set_state(ConnectionState::Closed, Some(&e.to_string()));
                Err(e)
            }
        }
    }

    fn set_state(&self, to: ConnectionState, reason: Option<&str>) {
        let mut machine = self.inner.machine.lock();
        match machine.transition(to, reason) {
            Ok(()) => {
                self.inner.state_tx.send_replace(machine.state());
            }
            Err(e) => warn!(error = %e, "state transition refused"),
        }
    }

    /// Handle an error from an operation on an open link
    async fn on_failure(&self, transport: &mut Box<dyn Transport>, err: &Error) {
        if !err.is_link_failure() || self.state() != ConnectionState::Connected {
            return;
        }
        warn!(port = %self.port(), error = %err, "link failure");
        self.set_state(ConnectionState::Error, Some(&err.to_string()));
        let _ = transport.close().await;
        self.set_state(ConnectionState::Closed, None);
        self.spawn_reconnect();
    }

    fn spawn_reconnect(&self) {
        if !self.inner.config.auto_reconnect || self.inner.reconnect.lock().is_manually_disconnected() {
            return;
        }
        let mut slot = self.inner.reconnect_task.lock();
        if slot.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let conn = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { conn.reconnect_loop(token).await });
        *slot = Some(ReconnectTask { cancel, handle });
    }

    async fn reconnect_loop(self, cancel: CancellationToken) {
        loop {
            let delay = {
                let reconnect = self.inner.reconnect.lock();
                if reconnect.is_manually_disconnected() {
                    break;
                }
                reconnect.delay()
            };

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            if self.inner.reconnect.lock().is_manually_disconnected() {
                break;
            }
            let mut transport = tokio::select! {
                () = cancel.cancelled() => break,
                guard = self.inner.transport.lock() => guard,
            };
            if self.inner.reconnect.lock().is_manually_disconnected() || self.state() == ConnectionState::Connected {
                break;
            }

            match self.open_link(&mut transport).await {
                Ok(_) => {
                    info!(port = %self.port(), "reconnected");
                    break;
                }
                Err(e) => {
                    let (attempt, next) = {
                        let mut reconnect = self.inner.reconnect.lock();
                        let next = reconnect.record_failure();
                        (reconnect.attempts(), next)
                    };
                    warn!(port = %self.port(), attempt, error = %e, next_delay = ?next, "reconnect failed");
                }
            }
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.inner.machine.lock().state()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Tap every frame received through this connection
    pub fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.inner.frame_tx.subscribe()
    }

    /// State history
    pub fn history(&self) -> Vec<StateTransition> {
        self.inner.machine.lock().history().to_vec()
    }

    /// Port or link name
    pub fn port(&self) -> &str {
        &self.inner.config.adapter.port
    }

    /// Serial baud rate
    pub fn baud_rate(&self) -> u32 {
        self.inner.config.adapter.baud_rate
    }

    /// Default per-operation timeout
    pub fn timeout(&self) -> Duration {
        self.inner.config.adapter.timeout
    }

    /// Adapter kind
    pub fn kind(&self) -> AdapterKind {
        self.inner.kind
    }

    /// What the adapter reported on the last successful open
    pub fn adapter_info(&self) -> Option<AdapterInfo> {
        self.inner.adapter_info.read().clone()
    }

    /// When the current connection was established
    pub fn connected_at(&self) -> Option<DateTime<Local>> {
        self.inner.machine.lock().connected_at()
    }

    /// Last successful exchange
    pub fn last_activity(&self) -> Option<DateTime<Local>> {
        self.inner.machine.lock().last_activity()
    }

    /// Delay before the next automatic reconnection attempt
    pub fn reconnect_delay(&self) -> Duration {
        self.inner.reconnect.lock().delay()
    }

    /// Whether the operator disconnected manually
    pub fn is_manually_disconnected(&self) -> bool {
        self.inner.reconnect.lock().is_manually_disconnected()
    }

    /// Whether a reconnection task is pending
    pub fn is_reconnecting(&self) -> bool {
        self.inner
            .reconnect_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Transport statistics, unless an operation holds the link
    pub fn stats(&self) -> Option<TransportStats> {
        self.inner.transport.try_lock().ok().map(|t| t.stats())
    }
}

/// Exclusive use of the link for one or more exchanges
pub struct LinkGuard<'a> {
    conn: &'a Connection,
    transport: MutexGuard<'a, Box<dyn Transport>>,
}

impl LinkGuard<'_> {
    fn ensure_connected(&self) -> Result<()> {
        if self.conn.state() == ConnectionState::Connected {
            return Ok(());
        }
        let reason = if self.conn.is_manually_disconnected() {
            "manually disconnected".to_string()
        } else {
            format!("connection {}", self.conn.state())
        };
        Err(ConnectionError::Disconnected(reason).into())
    }

    async fn checked<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(v) => {
                self.conn.inner.machine.lock().touch();
                Ok(v)
            }
            Err(e) => {
                self.conn.on_failure(&mut self.transport, &e).await;
                Err(e)
            }
        }
    }

    /// Send one frame with the default timeout
    pub async fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let timeout = self.conn.timeout();
        self.send_timeout(frame, timeout).await
    }

    /// Send one frame and wait for the adapter's acknowledgement
    pub async fn send_timeout(&mut self, frame: &CanFrame, timeout: Duration) -> Result<()> {
        self.ensure_connected()?;
        let result = self.transport.send(frame, timeout).await;
        self.checked(result).await
    }

    /// Receive one frame, `None` on timeout
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        self.ensure_connected()?;
        let result = self.transport.receive(timeout).await;
        let result = self.checked(result).await?;
        if let Some(frame) = &result {
            let _ = self.conn.inner.frame_tx.send(frame.clone());
        }
        Ok(result)
    }

    /// Send `request` and wait for a data frame with `response_id`.
    ///
    /// Unrelated frames received meanwhile still reach the frame tap.
    pub async fn request(&mut self, request: &CanFrame, response_id: u32, timeout: Duration) -> Result<CanFrame> {
        self.send_timeout(request, timeout).await?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TimeoutError::Read(timeout).into());
            }
            match self.receive(remaining).await? {
                Some(frame) if frame.id() == response_id && !frame.is_remote() => return Ok(frame),
                Some(_) => {}
                None => return Err(TimeoutError::Read(timeout).into()),
            }
        }
    }

    /// The owning connection
    pub fn connection(&self) -> &Connection {
        self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::CanError;
    use crate::core::transport::{MockTransport, ReplayControl, ReplayTransport};

    fn replay() -> (ReplayControl, Box<dyn Transport>) {
        let control = ReplayControl::new();
        let transport = ReplayTransport::new("test", control.clone());
        (control, Box::new(transport))
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new(AdapterConfig::new("test", 115_200).timeout(Duration::from_millis(200))).backoff(
            BackoffPolicy {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(8),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_operation_is_rejected() {
        let (_control, transport) = replay();
        let conn = Connection::with_transport(transport, config()).await.unwrap();

        let guard = conn.lock().unwrap();
        let err = conn.receive(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_busy());
        drop(guard);
        assert!(conn.receive(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_is_surfaced_without_retry() {
        let mut mock = MockTransport::new();
        mock.expect_kind().return_const(AdapterKind::Slcan);
        mock.expect_describe().return_const("mock".to_string());
        mock.expect_is_open().return_const(true);
        mock.expect_open().times(1).returning(|| {
            Ok(AdapterInfo {
                kind: AdapterKind::Slcan,
                hardware_version: "10".into(),
                firmware_version: "13".into(),
            })
        });
        mock.expect_send()
            .times(1)
            .returning(|_, _| Err(CanError::Rejected.into()));

        let conn = Connection::with_transport(Box::new(mock), config()).await.unwrap();
        let frame = CanFrame::new(0x100, &[1]).unwrap();
        let err = conn.send(&frame).await.unwrap_err();
        assert!(matches!(err, Error::Can(CanError::Rejected)));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_failure_reconnects_with_backoff() {
        let (control, transport) = replay();
        let conn = Connection::with_transport(transport, config()).await.unwrap();

        control.unplug();
        let err = conn.receive(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_link_failure());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.is_reconnecting());

        // first attempt after 1s fails (still unplugged), delay doubles
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(control.open_attempts(), 2);
        assert_eq!(conn.reconnect_delay(), Duration::from_secs(2));

        control.plug();
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.reconnect_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_cancels_pending_reconnect() {
        let (control, transport) = replay();
        let conn = Connection::with_transport(transport, config()).await.unwrap();

        control.unplug();
        let _ = conn.receive(Duration::from_millis(10)).await;
        assert!(conn.is_reconnecting());

        conn.manual_disconnect().await;
        assert!(!conn.is_reconnecting());
        assert!(conn.is_manually_disconnected());

        control.plug();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(control.open_attempts(), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);

        let err = conn.receive(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.to_string().contains("manually disconnected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_is_immediate_and_resets_backoff() {
        let (control, transport) = replay();
        let conn = Connection::with_transport(transport, config()).await.unwrap();

        control.unplug();
        let _ = conn.receive(Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(conn.reconnect_delay(), Duration::from_secs(2));

        control.plug();
        let before = Instant::now();
        conn.manual_connect().await.unwrap();
        assert_eq!(before.elapsed(), Duration::ZERO);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.reconnect_delay(), Duration::from_secs(1));
        assert!(!conn.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_surfaces_open_errors() {
        let (control, transport) = replay();
        let conn = Connection::new(transport, config());

        control.fail_next_open(ConnectionError::PermissionDenied("test".into()));
        let err = conn.manual_connect().await.unwrap_err();
        assert!(matches!(err, Error::Connection(ConnectionError::PermissionDenied(_))));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_reconnecting());

        conn.manual_connect().await.unwrap();
        assert!(conn.adapter_info().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_skips_unrelated_frames() {
        let (control, transport) = replay();
        control.set_responder(|_| {
            crate::core::transport::Reply::Ack(vec![
                CanFrame::new_extended(0x0C00_7FE0, &[9]).unwrap(),
                CanFrame::new_extended(0x0C00_3FE0, &[1, 2]).unwrap(),
            ])
        });
        let conn = Connection::with_transport(transport, config()).await.unwrap();
        let mut tap = conn.subscribe();

        let request = CanFrame::new_remote(0x0400_3FE0, true).unwrap();
        let reply = conn.request(&request, 0x0C00_3FE0, Duration::from_millis(200)).await.unwrap();
        assert_eq!(reply.data(), &[1, 2]);
        assert_eq!(tap.try_recv().unwrap().id(), 0x0C00_7FE0);
        assert!(conn.last_activity().is_some());
    }
}
