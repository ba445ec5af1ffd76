//! # Tick Scheduler Module
//!
//! The coarse heartbeat of the tuner. A periodic timer interrupt calls
//! [`TickState::on_tick`], which raises the tick flag and advances both counters. The
//! main loop only ever clears the flag and rewinds the pitch counter with atomic
//! read-modify-write operations, so an increment landing in between is never lost.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

/// Tick flag and counters shared between the tick interrupt and the main loop.
#[derive(Debug)]
pub struct TickState {
    tick: AtomicBool,
    ticks_since_startup: AtomicU32,
    ticks_since_last_pitch_change: AtomicU32,
    ticks_per_second: u32,
}

impl TickState {
    pub fn new(ticks_per_second: u32) -> Self {
        Self {
            tick: AtomicBool::new(false),
            ticks_since_startup: AtomicU32::new(0),
            ticks_since_last_pitch_change: AtomicU32::new(0),
            ticks_per_second: ticks_per_second.max(1),
        }
    }

    /// Interrupt handler body. Constant work, no calls out.
    pub fn on_tick(&self) {
        self.ticks_since_startup.fetch_add(1, Ordering::Relaxed);
        self.ticks_since_last_pitch_change.fetch_add(1, Ordering::Relaxed);
        self.tick.store(true, Ordering::Release);
    }

    /// Clears the tick flag, returning whether it was set.
    pub fn take_tick(&self) -> bool {
        self.tick.swap(false, Ordering::AcqRel)
    }

    pub fn ticks_since_startup(&self) -> u32 {
        self.ticks_since_startup.load(Ordering::Acquire)
    }

    pub fn ticks_since_last_pitch_change(&self) -> u32 {
        self.ticks_since_last_pitch_change.load(Ordering::Acquire)
    }

    pub fn ticks_per_second(&self) -> u32 {
        self.ticks_per_second
    }

    /// Whether a whole wall-clock second has passed since the current pitch started.
    ///
    /// When every tick is observed this is exactly `ticks % ticks_per_second == 0`;
    /// it also holds if the main loop fell behind by a few ticks.
    pub fn second_elapsed(&self) -> bool {
        self.ticks_since_last_pitch_change() >= self.ticks_per_second
    }

    /// Starts the next pitch second by removing one second's worth of ticks.
    ///
    /// Only call after [`second_elapsed`](Self::second_elapsed) returned true; the
    /// interrupt only ever increments, so the subtraction cannot underflow.
    pub fn rewind_pitch_timer(&self) {
        self.ticks_since_last_pitch_change
            .fetch_sub(self.ticks_per_second, Ordering::AcqRel);
    }

    /// Milliseconds since startup, at tick resolution.
    pub fn now_ms(&self) -> u64 {
        u64::from(self.ticks_since_startup()) * 1000 / u64::from(self.ticks_per_second)
    }

    /// Tick period.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(1) / self.ticks_per_second
    }
}

/// A periodic timer that drives [`TickState::on_tick`].
pub trait TickTimer {
    type Error;

    fn configure(&mut self, interval: Duration);

    /// Arms the periodic interrupt with `handler` as its body.
    fn start(&mut self, handler: Arc<TickState>) -> Result<(), Self::Error>;
}

/// Host tick timer: a dedicated thread that sleeps one interval between firings.
///
/// Dropping the ticker signals the thread and joins it.
#[derive(Debug)]
pub struct ThreadTicker {
    interval: Duration,
    shutdown_tx: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ThreadTicker {
    pub fn new() -> Self {
        Self {
            interval: Duration::from_secs(1),
            shutdown_tx: None,
            thread_handle: None,
        }
    }

    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel, which ends the loop too.
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                log::error!("[TICK] ticker thread panicked");
            }
        }
    }
}

impl Default for ThreadTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl TickTimer for ThreadTicker {
    type Error = std::io::Error;

    fn configure(&mut self, interval: Duration) {
        self.interval = interval;
    }

    fn start(&mut self, handler: Arc<TickState>) -> Result<(), Self::Error> {
        self.stop();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("tick".into())
            .spawn(move || {
                log::debug!("[TICK] ticker running every {:?}", interval);
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => handler.on_tick(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("[TICK] ticker stopped");
            })?;
        self.shutdown_tx = Some(shutdown_tx);
        self.thread_handle = Some(handle);
        Ok(())
    }
}

impl Drop for ThreadTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tick timer for the discrete-event simulation; firings are driven explicitly.
#[derive(Debug, Default)]
pub struct ManualTicker {
    interval: Option<Duration>,
    handler: Option<Arc<TickState>>,
}

impl ManualTicker {
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Fires the interrupt once. Does nothing before `start`.
    pub fn fire(&self) {
        if let Some(handler) = &self.handler {
            handler.on_tick();
        }
    }
}

impl TickTimer for ManualTicker {
    type Error = Infallible;

    fn configure(&mut self, interval: Duration) {
        self.interval = Some(interval);
    }

    fn start(&mut self, handler: Arc<TickState>) -> Result<(), Self::Error> {
        self.handler = Some(handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn each_tick_increments_both_counters_once() {
        let state = TickState::new(16);
        assert!(!state.take_tick());

        state.on_tick();
        assert_eq!(state.ticks_since_startup(), 1);
        assert_eq!(state.ticks_since_last_pitch_change(), 1);
        assert!(state.take_tick());
        assert!(!state.take_tick());
    }

    #[test]
    fn second_elapses_after_ticks_per_second() {
        let state = TickState::new(16);
        for _ in 0..15 {
            state.on_tick();
            assert!(!state.second_elapsed());
        }
        state.on_tick();
        assert!(state.second_elapsed());

        state.rewind_pitch_timer();
        assert_eq!(state.ticks_since_last_pitch_change(), 0);
        assert_eq!(state.ticks_since_startup(), 16);
        assert_eq!(state.now_ms(), 1000);
    }

    #[test]
    fn late_rewind_keeps_ticks_that_arrived_meanwhile() {
        let state = TickState::new(16);
        for _ in 0..18 {
            state.on_tick();
        }
        assert!(state.second_elapsed());
        state.rewind_pitch_timer();
        assert_eq!(state.ticks_since_last_pitch_change(), 2);
        assert!(!state.second_elapsed());
    }

    #[test]
    fn interval_matches_rate() {
        assert_eq!(TickState::new(16).interval(), Duration::from_micros(62_500));
    }

    #[test]
    fn manual_ticker_fires_only_after_start() {
        let state = Arc::new(TickState::new(16));
        let mut ticker = ManualTicker::default();
        ticker.configure(state.interval());
        ticker.fire();
        assert_eq!(state.ticks_since_startup(), 0);

        ticker.start(Arc::clone(&state)).unwrap();
        ticker.fire();
        ticker.fire();
        assert_eq!(state.ticks_since_startup(), 2);
        assert_eq!(ticker.interval(), Some(Duration::from_micros(62_500)));
    }

    #[test]
    fn thread_ticker_fires_until_stopped() {
        let state = Arc::new(TickState::new(1000));
        let mut ticker = ThreadTicker::new();
        ticker.configure(Duration::from_millis(1));
        ticker.start(Arc::clone(&state)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while state.ticks_since_startup() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        ticker.stop();
        let stopped_at = state.ticks_since_startup();
        assert!(stopped_at >= 3);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(state.ticks_since_startup(), stopped_at);
    }
}
