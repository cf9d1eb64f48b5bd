//! Lifecycle supervisor: start the listener, race the watchdogs, drain, and
//! clean up.

use anyhow::{Context as _, Result};
use socket2::{Domain, Socket, TcpKeepalive, Type};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Preferences;
use crate::content::Content;
use crate::netselect;
use crate::server::session::Session;
use crate::server::{routes, AppState};
use crate::ui;

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// The event that ended the session. Exactly one fires per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    AllTransfersComplete,
    IdleTimeout,
    ExternalSignal,
}

/// Single-fire stop signal shared by the watchdogs and the request handlers.
#[derive(Clone)]
pub struct StopSignal {
    reason: Arc<OnceLock<Terminator>>,
    token: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            reason: Arc::new(OnceLock::new()),
            token: CancellationToken::new(),
        }
    }

    /// Fire the signal. Idempotent: the first terminator wins, duplicates
    /// are ignored.
    pub fn fire(&self, terminator: Terminator) {
        if self.reason.set(terminator).is_ok() {
            tracing::debug!(?terminator, "stop signal fired");
        }
        self.token.cancel();
    }

    /// Resolves once the signal has fired.
    pub async fn fired(&self) {
        self.token.cancelled().await;
    }

    pub fn reason(&self) -> Option<Terminator> {
        self.reason.get().copied()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Options threaded in from the CLI. Immutable for the session's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    pub idle_timeout: Duration,
    pub quiet: bool,
}

/// Run one transfer session to completion and return the terminator that
/// ended it.
pub async fn serve(
    content: Content,
    ip: IpAddr,
    preferences: Preferences,
    options: ServeOptions,
) -> Result<Terminator> {
    let listener = bind_keepalive_listener(ip).context("Failed to bind listener")?;
    let port = listener.local_addr()?.port();

    let session = Arc::new(Session::new());
    let content = Arc::new(content);
    let stop = StopSignal::new();

    let state = AppState {
        session: session.clone(),
        content: content.clone(),
        stop: stop.clone(),
    };
    let app = routes::create_router(&state);

    let url = format!(
        "http://{}:{}/{}",
        netselect::display_host(ip),
        port,
        session.url_path()
    );
    tracing::debug!(%url, "session route registered");
    ui::present(&url, options.quiet);

    // Serve in the background; the handle drives graceful shutdown.
    let handle = axum_server::Handle::new();
    let server_handle = handle.clone();
    let server_task = tokio::spawn(async move {
        axum_server::from_tcp(listener)
            .handle(server_handle)
            .serve(app.into_make_service())
            .await
    });

    spawn_watchdogs(session, stop.clone(), options.idle_timeout);

    stop.fired().await;
    let terminator = stop.reason().unwrap_or(Terminator::ExternalSignal);
    tracing::info!(?terminator, "session ending");

    // Draining: stop accepting, let in-flight responses finish.
    handle.graceful_shutdown(None);
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!("server error during shutdown: {err}"),
        Err(err) => tracing::error!("server task failed: {err}"),
    }

    cleanup(&content, &preferences);

    Ok(terminator)
}

/// Three watchdogs race to fire the stop signal. The idle watchdog also owns
/// the phantom unit: it releases it when it observes first contact, or at
/// the idle bound when nobody ever connected.
fn spawn_watchdogs(session: Arc<Session>, stop: StopSignal, idle_timeout: Duration) {
    let completion_session = session.clone();
    let completion_stop = stop.clone();
    tokio::spawn(async move {
        completion_session.gauge().idle().await;
        completion_stop.fire(Terminator::AllTransfersComplete);
    });

    let idle_stop = stop.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = session.gauge().first_contact() => {}
            _ = tokio::time::sleep(idle_timeout) => {
                idle_stop.fire(Terminator::IdleTimeout);
            }
        }
        session.gauge().release_phantom();
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("Failed to listen for Ctrl+C");
            return;
        }
        stop.fire(Terminator::ExternalSignal);
    });
}

/// Post-shutdown cleanup. Errors are logged, never escalated: the session
/// has already ended from the client's perspective.
fn cleanup(content: &Content, preferences: &Preferences) {
    if let Err(err) = content.cleanup() {
        tracing::warn!("unable to delete the content from disk: {err}");
    }
    if let Err(err) = preferences.save() {
        tracing::warn!("unable to update the preferences file: {err}");
    }
}

/// Bind on an OS-assigned port with TCP keepalive enabled, so idle
/// mobile-network clients are not dropped mid-transfer.
fn bind_keepalive_listener(ip: IpAddr) -> Result<TcpListener> {
    let domain = match ip {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, None).context("Failed to create socket")?;
    // Keepalive is set on the listening socket; accepted connections inherit
    // it on Linux and macOS. A port to a platform without that inheritance
    // must set it per accepted connection instead.
    socket
        .set_keepalive(true)
        .context("Failed to enable TCP keepalive")?;
    socket
        .set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_PERIOD))
        .context("Failed to configure TCP keepalive period")?;
    socket
        .bind(&SocketAddr::new(ip, 0).into())
        .with_context(|| format!("Failed to bind {ip}"))?;
    socket.listen(128).context("Failed to listen")?;

    let listener: TcpListener = socket.into();
    listener
        .set_nonblocking(true)
        .context("Failed to set listener to non-blocking mode")?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_first_terminator_wins() {
        let stop = StopSignal::new();
        stop.fire(Terminator::IdleTimeout);
        stop.fire(Terminator::ExternalSignal);
        assert_eq!(stop.reason(), Some(Terminator::IdleTimeout));
    }

    #[tokio::test]
    async fn stop_signal_wakes_waiters() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.fired().await })
        };
        stop.fire(Terminator::AllTransfersComplete);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("waiter task");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_watchdog_fires_when_nobody_connects() {
        let session = Arc::new(Session::new());
        let stop = StopSignal::new();
        spawn_watchdogs(session.clone(), stop.clone(), Duration::from_secs(600));

        stop.fired().await;
        assert_eq!(stop.reason(), Some(Terminator::IdleTimeout));
        // phantom released on the way out
        assert_eq!(session.gauge().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_watchdog_fires_after_transfers_finish() {
        let session = Arc::new(Session::new());
        let stop = StopSignal::new();
        spawn_watchdogs(session.clone(), stop.clone(), Duration::from_secs(600));

        let permit = session.gauge().acquire();
        // let the idle watchdog observe contact and release the phantom
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(permit);

        stop.fired().await;
        assert_eq!(stop.reason(), Some(Terminator::AllTransfersComplete));
    }

    #[test]
    fn keepalive_listener_binds_os_assigned_port() {
        let listener =
            bind_keepalive_listener(IpAddr::from([127, 0, 0, 1])).expect("bind loopback");
        assert_ne!(listener.local_addr().expect("local addr").port(), 0);
    }
}
