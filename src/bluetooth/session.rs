//! Outbound session state machine.
//!
//! One session delivers one frame to one peer:
//!
//! `Idle -> Connecting -> NegotiatingCapability -> DiscoveringServices -> Writing -> Completed | Failed`
//!
//! Each step suspends until the link answers. The connection is released
//! exactly once whichever state ends the session, including when the
//! owning future is dropped.

use log::{debug, warn};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::link::{BleLink, GattConnection, GattService};
use super::protocol::{MESSAGE_CHARACTERISTIC_UUID, REQUESTED_MTU, SERVICE_UUID};
use crate::error::{LinkError, SendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    NegotiatingCapability,
    DiscoveringServices,
    Writing,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

/// Timing and capability knobs for outbound sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub requested_mtu: u16,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            requested_mtu: REQUESTED_MTU,
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(10),
        }
    }
}

/// How a session ended, with the states it went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Latency from the start of `Connecting` to the write acknowledgement.
    pub result: Result<Duration, SendError>,
    pub trace: Vec<SessionState>,
}

enum Interrupt {
    LinkLost,
    Shutdown,
}

pub struct OutboundSession<'a> {
    link: &'a dyn BleLink,
    address: String,
    payload: Vec<u8>,
    settings: SessionSettings,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
    trace: Vec<SessionState>,
}

impl<'a> OutboundSession<'a> {
    pub fn new(
        link: &'a dyn BleLink,
        address: &str,
        payload: Vec<u8>,
        settings: SessionSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            link,
            address: address.to_string(),
            payload,
            settings,
            shutdown,
            state: SessionState::Idle,
            trace: vec![SessionState::Idle],
        }
    }

    pub async fn run(mut self) -> SessionOutcome {
        let started = Instant::now();
        self.advance(SessionState::Connecting);

        let connect_timeout = self.settings.connect_timeout;
        let link = self.link;
        let address = self.address.clone();
        let connected = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut self.shutdown) => Err(SendError::Aborted),
            result = tokio::time::timeout(connect_timeout, link.connect(&address)) => match result {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(e)) => {
                    debug!("Connect to {} failed: {}", address, e);
                    Err(SendError::PeerUnreachable)
                }
                Err(_) => {
                    debug!("Connect to {} timed out", address);
                    Err(SendError::PeerUnreachable)
                }
            },
        };

        let result = match connected {
            Ok(conn) => {
                let mut guard = ConnectionGuard::new(conn);
                let result = match guard.connection() {
                    Some(conn) => self.drive(conn, started).await,
                    None => Err(SendError::PeerUnreachable),
                };
                guard.release().await;
                result
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(latency) => {
                self.advance(SessionState::Completed);
                debug!("Delivered {} bytes to {} in {:?}", self.payload.len(), self.address, latency);
            }
            Err(e) => {
                self.advance(SessionState::Failed);
                warn!("Send to {} failed: {}", self.address, e);
            }
        }

        SessionOutcome {
            result,
            trace: self.trace,
        }
    }

    async fn drive(&mut self, conn: &dyn GattConnection, started: Instant) -> Result<Duration, SendError> {
        self.advance(SessionState::NegotiatingCapability);
        let mtu = self.settings.requested_mtu;
        match self.step(conn, conn.request_mtu(mtu)).await {
            Ok(Ok(granted)) => debug!("MTU negotiated with {}: {}", self.address, granted),
            // Refusal is not fatal; continue with the default MTU.
            Ok(Err(e)) => debug!("MTU request refused by {} ({}), continuing", self.address, e),
            Err(Interrupt::LinkLost) => return Err(SendError::PeerUnreachable),
            Err(Interrupt::Shutdown) => return Err(SendError::Aborted),
        }

        self.advance(SessionState::DiscoveringServices);
        let services = match self.step(conn, conn.discover_services()).await {
            Ok(Ok(services)) => services,
            Ok(Err(e)) => {
                debug!("Service discovery on {} failed: {}", self.address, e);
                return Err(SendError::ServiceNotFound);
            }
            Err(Interrupt::LinkLost) => return Err(SendError::PeerUnreachable),
            Err(Interrupt::Shutdown) => return Err(SendError::Aborted),
        };

        if !exposes_message_characteristic(&services) {
            return Err(SendError::ServiceNotFound);
        }

        self.advance(SessionState::Writing);
        let payload = self.payload.clone();
        match self
            .step(conn, conn.write(SERVICE_UUID, MESSAGE_CHARACTERISTIC_UUID, &payload))
            .await
        {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(e)) => {
                debug!("Write to {} rejected: {}", self.address, e);
                Err(SendError::WriteRejected)
            }
            Err(Interrupt::LinkLost) => Err(SendError::WriteRejected),
            Err(Interrupt::Shutdown) => Err(SendError::Aborted),
        }
    }

    /// Run one link operation, bounded by the operation timeout and cut short
    /// by a link drop or shutdown.
    async fn step<T, F>(&mut self, conn: &dyn GattConnection, op: F) -> Result<Result<T, LinkError>, Interrupt>
    where
        F: Future<Output = Result<T, LinkError>>,
    {
        let timeout = self.settings.operation_timeout;
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut self.shutdown) => Err(Interrupt::Shutdown),
            result = tokio::time::timeout(timeout, op) => Ok(result.unwrap_or(Err(LinkError::Timeout))),
            _ = conn.link_lost() => Err(Interrupt::LinkLost),
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            next > self.state && !self.state.is_terminal(),
            "invalid session transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("Session {}: {:?} -> {:?}", self.address, self.state, next);
        self.state = next;
        self.trace.push(next);
    }
}

fn exposes_message_characteristic(services: &[GattService]) -> bool {
    services
        .iter()
        .any(|s| s.uuid == SERVICE_UUID && s.characteristics.contains(&MESSAGE_CHARACTERISTIC_UUID))
}

/// Resolves once shutdown has been signalled. Never resolves if the
/// signal's sender is gone without signalling.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Owns the connection of one session and closes it exactly once.
struct ConnectionGuard {
    conn: Option<Box<dyn GattConnection>>,
}

impl ConnectionGuard {
    fn new(conn: Box<dyn GattConnection>) -> Self {
        Self { conn: Some(conn) }
    }

    fn connection(&self) -> Option<&dyn GattConnection> {
        self.conn.as_deref()
    }

    async fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        // Reached only when the session future is abandoned mid-flight.
        if let Some(conn) = self.conn.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { conn.close().await });
                }
                Err(_) => warn!("Abandoned session outside a runtime; connection left to the backend"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::testing::{FakeLink, PeerBehavior};
    use std::sync::Arc;

    fn settings() -> SessionSettings {
        SessionSettings {
            requested_mtu: 512,
            connect_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(2),
        }
    }

    async fn run(link: &FakeLink, address: &str) -> SessionOutcome {
        let (_tx, rx) = watch::channel(false);
        OutboundSession::new(link, address, b"BRD:hi".to_vec(), settings(), rx)
            .run()
            .await
    }

    #[tokio::test]
    async fn happy_path_visits_every_state_in_order() {
        let link = FakeLink::new();
        link.add_peer("AA", PeerBehavior::default());

        let outcome = run(&link, "AA").await;
        assert!(outcome.result.is_ok());
        assert_eq!(
            outcome.trace,
            vec![
                SessionState::Idle,
                SessionState::Connecting,
                SessionState::NegotiatingCapability,
                SessionState::DiscoveringServices,
                SessionState::Writing,
                SessionState::Completed,
            ]
        );
        assert_eq!(link.writes_to("AA"), vec![b"BRD:hi".to_vec()]);
        assert_eq!(link.closes("AA"), 1);
    }

    #[tokio::test]
    async fn unknown_address_is_unreachable() {
        let link = FakeLink::new();
        let outcome = run(&link, "GONE").await;
        assert_eq!(outcome.result, Err(SendError::PeerUnreachable));
        assert_eq!(
            outcome.trace,
            vec![SessionState::Idle, SessionState::Connecting, SessionState::Failed]
        );
    }

    #[tokio::test]
    async fn refused_mtu_degrades_and_still_delivers() {
        let link = FakeLink::new();
        link.add_peer(
            "AA",
            PeerBehavior {
                refuse_mtu: true,
                ..PeerBehavior::default()
            },
        );

        let outcome = run(&link, "AA").await;
        assert!(outcome.result.is_ok());
        assert_eq!(link.writes_to("AA").len(), 1);
    }

    #[tokio::test]
    async fn missing_service_fails_and_releases() {
        let link = FakeLink::new();
        link.add_peer(
            "AA",
            PeerBehavior {
                has_service: false,
                ..PeerBehavior::default()
            },
        );

        let outcome = run(&link, "AA").await;
        assert_eq!(outcome.result, Err(SendError::ServiceNotFound));
        assert!(!outcome.trace.contains(&SessionState::Writing));
        assert_eq!(link.closes("AA"), 1);
    }

    #[tokio::test]
    async fn disconnect_while_writing_is_write_rejected() {
        let link = FakeLink::new();
        link.add_peer(
            "AA",
            PeerBehavior {
                disconnect_on_write: true,
                ..PeerBehavior::default()
            },
        );

        let outcome = run(&link, "AA").await;
        assert_eq!(outcome.result, Err(SendError::WriteRejected));
        assert_eq!(outcome.trace.last(), Some(&SessionState::Failed));
        assert!(outcome.trace.contains(&SessionState::Writing));
        assert_eq!(link.closes("AA"), 1);
    }

    #[tokio::test]
    async fn disconnect_during_discovery_is_unreachable() {
        let link = FakeLink::new();
        link.add_peer(
            "AA",
            PeerBehavior {
                disconnect_on_discover: true,
                ..PeerBehavior::default()
            },
        );

        let outcome = run(&link, "AA").await;
        assert_eq!(outcome.result, Err(SendError::PeerUnreachable));
        assert!(outcome.trace.contains(&SessionState::DiscoveringServices));
        assert!(!outcome.trace.contains(&SessionState::Writing));
        assert_eq!(outcome.trace.last(), Some(&SessionState::Failed));
        assert!(link.writes_to("AA").is_empty());
        assert_eq!(link.closes("AA"), 1);
    }

    #[tokio::test]
    async fn rejected_write_fails() {
        let link = FakeLink::new();
        link.add_peer(
            "AA",
            PeerBehavior {
                reject_write: true,
                ..PeerBehavior::default()
            },
        );

        let outcome = run(&link, "AA").await;
        assert_eq!(outcome.result, Err(SendError::WriteRejected));
        assert_eq!(link.closes("AA"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_an_open_session() {
        let link = Arc::new(FakeLink::new());
        link.add_peer(
            "AA",
            PeerBehavior {
                write_delay: Some(Duration::from_secs(60)),
                ..PeerBehavior::default()
            },
        );

        let (tx, rx) = watch::channel(false);
        let session_link = link.clone();
        let task = tokio::spawn(async move {
            OutboundSession::new(session_link.as_ref(), "AA", b"BRD:x".to_vec(), settings(), rx)
                .run()
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send_replace(true);

        let outcome = task.await.unwrap();
        assert_eq!(outcome.result, Err(SendError::Aborted));
        assert_eq!(link.closes("AA"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_write_times_out_as_rejected() {
        let link = FakeLink::new();
        link.add_peer(
            "AA",
            PeerBehavior {
                write_delay: Some(Duration::from_secs(30)),
                ..PeerBehavior::default()
            },
        );

        let outcome = run(&link, "AA").await;
        assert_eq!(outcome.result, Err(SendError::WriteRejected));
        assert_eq!(link.closes("AA"), 1);
    }

    #[tokio::test]
    async fn abandoned_session_still_releases_connection() {
        let link = Arc::new(FakeLink::new());
        link.add_peer(
            "AA",
            PeerBehavior {
                write_delay: Some(Duration::from_secs(60)),
                ..PeerBehavior::default()
            },
        );

        let (_tx, rx) = watch::channel(false);
        let session_link = link.clone();
        let task = tokio::spawn(async move {
            OutboundSession::new(session_link.as_ref(), "AA", b"BRD:x".to_vec(), settings(), rx)
                .run()
                .await
        });

        link.wait_for_write_started("AA").await;
        task.abort();
        let _ = task.await;

        // The release runs on a task spawned from the guard's drop.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(link.closes("AA"), 1);
    }
}
