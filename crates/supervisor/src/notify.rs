//! A minimal service-manager notification client (spec.md §6): sends a
//! ready notification after startup, periodic watchdog keepalives, and a
//! stopping notification before exit, over the `sd_notify` datagram
//! protocol. Inert when `NOTIFY_SOCKET` is absent from the environment —
//! the common case when not running under a service manager.

use std::{env, os::unix::net::UnixDatagram, time::Duration};

use signal::{CancellationToken, Tick, Ticker};

/// A connected (or inert) notification socket.
pub struct Notifier {
    socket: Option<UnixDatagram>,
}

impl Notifier {
    /// Builds a notifier from `NOTIFY_SOCKET`, connecting if present.
    pub fn from_env() -> Self {
        let socket = env::var_os("NOTIFY_SOCKET").and_then(|path| {
            let socket = UnixDatagram::unbound().ok()?;
            socket.connect(&path).ok()?;
            Some(socket)
        });
        Self { socket }
    }

    /// Whether a notify socket was found and connected.
    pub fn is_active(&self) -> bool {
        self.socket.is_some()
    }

    fn send(&self, message: &str) {
        if let Some(socket) = &self.socket {
            if let Err(err) = socket.send(message.as_bytes()) {
                tracing::warn!(error = %err, "failed to notify the service manager");
            }
        }
    }

    /// Sends the ready notification, once, after startup completes.
    pub fn ready(&self) {
        self.send("READY=1\n");
    }

    /// Sends the stopping notification before the process exits.
    pub fn stopping(&self) {
        self.send("STOPPING=1\n");
    }

    fn watchdog(&self) {
        self.send("WATCHDOG=1\n");
    }

    /// Runs the watchdog keepalive loop at half `WATCHDOG_USEC`, until
    /// `cancel` fires. Returns immediately if there is no socket or no
    /// watchdog interval configured.
    pub async fn run_keepalive(&self, cancel: CancellationToken) {
        if !self.is_active() {
            return;
        }
        let Some(period) = watchdog_period() else {
            return;
        };

        let mut ticker = Ticker::new(period, cancel);
        loop {
            match ticker.tick().await {
                Tick::Elapsed => self.watchdog(),
                Tick::Cancelled => break,
            }
        }
    }
}

fn watchdog_period() -> Option<Duration> {
    let usec: u64 = env::var("WATCHDOG_USEC").ok()?.parse().ok()?;
    if usec == 0 {
        return None;
    }
    Some(Duration::from_micros(usec) / 2)
}

#[cfg(test)]
#[allow(unsafe_code)]
mod test {
    use super::*;

    #[test]
    fn inert_without_notify_socket() {
        // SAFETY: test-local, no other thread reads these variables concurrently.
        unsafe {
            env::remove_var("NOTIFY_SOCKET");
        }
        let notifier = Notifier::from_env();
        assert!(!notifier.is_active());
        notifier.ready();
        notifier.stopping();
    }

    #[test]
    fn watchdog_period_is_half_the_configured_interval() {
        // SAFETY: test-local, no other thread reads these variables concurrently.
        unsafe {
            env::set_var("WATCHDOG_USEC", "2000000");
        }
        assert_eq!(watchdog_period(), Some(Duration::from_secs(1)));
        unsafe {
            env::remove_var("WATCHDOG_USEC");
        }
    }

    #[test]
    fn zero_watchdog_usec_disables_keepalive() {
        // SAFETY: test-local, no other thread reads these variables concurrently.
        unsafe {
            env::set_var("WATCHDOG_USEC", "0");
        }
        assert_eq!(watchdog_period(), None);
        unsafe {
            env::remove_var("WATCHDOG_USEC");
        }
    }
}
