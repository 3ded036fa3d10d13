//! Reference-counted, single-shot idle timer.
//!
//! The sole mechanism by which a container self-terminates after a
//! period with no in-flight requests. While the reference count is
//! zero and the timeout is positive, the timer is armed; any `ref`,
//! `unref`, or `set_duration` call cancels the current countdown and
//! restarts it from zero under the (possibly new) state. When the
//! deadline elapses with the reference count at zero, the fire channel
//! yields exactly once and the timer is finished.
//!
//! A dedicated task owns the state and drives `tokio::select!` over a
//! command channel and a sleep future, re-arming the sleep fresh on
//! every ref/unref/duration change.

use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

enum Command {
    Ref,
    Unref,
    SetDuration(Duration),
    Stop,
}

pub struct IdleTimer {
    cmd_tx: mpsc::UnboundedSender<Command>,
    fire_rx: Mutex<mpsc::Receiver<()>>,
}

impl IdleTimer {
    /// Create a new timer with initial timeout `d`. `d == Duration::ZERO`
    /// means "never fires" until `set_duration` is called with a
    /// positive value.
    pub fn new(d: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (fire_tx, fire_rx) = mpsc::channel(1);

        tokio::spawn(run_loop(cmd_rx, fire_tx, d));

        Self {
            cmd_tx,
            fire_rx: Mutex::new(fire_rx),
        }
    }

    /// Increment the reference count; disarms the timer while any
    /// reference is held. Returns `false` if the timer has already
    /// stopped.
    pub fn r#ref(&self) -> bool {
        self.cmd_tx.send(Command::Ref).is_ok()
    }

    /// Decrement the reference count; re-arms the timer with the
    /// current duration if the count returns to zero. Returns `false`
    /// if the timer has already stopped.
    pub fn unref(&self) -> bool {
        self.cmd_tx.send(Command::Unref).is_ok()
    }

    /// Replace the current timeout, cancelling any armed deadline and
    /// re-arming with the new value if the reference count is zero.
    /// Returns `false` if the timer has already stopped.
    pub fn set_duration(&self, d: Duration) -> bool {
        self.cmd_tx.send(Command::SetDuration(d)).is_ok()
    }

    /// Tear the timer down deterministically. Safe to call more than
    /// once or after the timer has already fired.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }

    /// Wait for the timer to fire. Resolves exactly once; after that
    /// the timer is finished and further calls resolve immediately
    /// (the channel is closed).
    pub async fn fired(&self) {
        let mut rx = self.fire_rx.lock().await;
        rx.recv().await;
    }
}

async fn run_loop(
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    fire_tx: mpsc::Sender<()>,
    mut d: Duration,
) {
    let mut refs: i64 = 0;

    loop {
        let armed = refs == 0 && !d.is_zero();

        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(Command::Stop) => return,
                    Some(Command::Ref) => refs += 1,
                    Some(Command::Unref) => refs -= 1,
                    Some(Command::SetDuration(nd)) => d = nd,
                }
            }
            _ = tokio::time::sleep(d), if armed => {
                let _ = fire_tx.send(()).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn fires_after_timeout_with_no_refs() {
        let timer = IdleTimer::new(Duration::from_millis(5));
        let start = Instant::now();
        timer.fired().await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn ref_suppresses_fire_until_unref() {
        let timer = IdleTimer::new(Duration::from_millis(5));
        assert!(timer.r#ref());

        let fired = tokio::time::timeout(Duration::from_millis(10), timer.fired()).await;
        assert!(fired.is_err(), "timer should not have fired while referenced");

        assert!(timer.unref());
        let start = Instant::now();
        timer.fired().await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn set_duration_restarts_the_countdown() {
        let timer = IdleTimer::new(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Shorten the timeout; it should now fire ~5ms from now, not
        // immediately and not at the original 50ms mark.
        timer.set_duration(Duration::from_millis(5));
        let start = Instant::now();
        timer.fired().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(5));
        assert!(elapsed < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_the_timer() {
        let timer = IdleTimer::new(Duration::from_secs(60));
        timer.stop();
        timer.stop();
        timer.fired().await; // resolves immediately, channel closed
    }
}
