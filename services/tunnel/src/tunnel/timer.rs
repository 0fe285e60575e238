//! Per-socket idle timer.
//!
//! Every read, write, connect and resolve arms the timer with the tunnel's
//! idle timeout; the matching completion disarms it. The timer is a resource
//! of its own: closing a socket takes it out and closes it independently of
//! the stream.

use std::future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{self, Instant, Sleep};

pub(crate) struct IdleTimer {
    sleep: Option<Pin<Box<Sleep>>>,
    period: Duration,
    armed: bool,
}

impl IdleTimer {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            sleep: Some(Box::pin(time::sleep(period))),
            period,
            armed: false,
        }
    }

    /// Arm (or re-arm) the countdown from now.
    pub(crate) fn start(&mut self) {
        if let Some(sleep) = self.sleep.as_mut() {
            sleep.as_mut().reset(Instant::now() + self.period);
            self.armed = true;
        }
    }

    pub(crate) fn stop(&mut self) {
        self.armed = false;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }

    /// Resolves when an armed timer expires. Never resolves while disarmed
    /// or after the timer has been closed.
    pub(crate) async fn expired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) if self.armed => sleep.as_mut().await,
            _ => future::pending().await,
        }
    }

    /// Take the underlying timer out for an asynchronous close.
    pub(crate) fn close(&mut self) -> Option<Pin<Box<Sleep>>> {
        self.armed = false;
        self.sleep.take()
    }
}
