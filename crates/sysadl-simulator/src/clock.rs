//! Simulation clock and run tokens
//!
//! The clock owns the controller-wide pause flag, the speed factor and a stop
//! generation. Every suspendable operation (sleep, condition wait, event wait)
//! takes a [`RunToken`] and checks it at its await boundaries. Pausing is
//! cooperative: a running task effect is never interrupted, the next boundary
//! simply blocks until play.

use crate::error::{EngineError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Snapshot of the clock controls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockState {
    /// Whether simulated time is paused
    pub paused: bool,
    /// Speed factor; sleeps and delays last `duration / speed`
    pub speed: f64,
    /// Incremented by every stop; tokens from older generations are stopped
    pub stop_generation: u64,
}

impl Default for ClockState {
    fn default() -> Self {
        Self {
            paused: false,
            speed: 1.0,
            stop_generation: 0,
        }
    }
}

/// Controllable clock shared by every component of one engine
#[derive(Debug)]
pub struct SimulationClock {
    state: watch::Sender<ClockState>,
    started: Instant,
}

impl SimulationClock {
    /// Create a running clock at normal speed
    pub fn new() -> Self {
        let (state, _) = watch::channel(ClockState::default());
        Self {
            state,
            started: Instant::now(),
        }
    }

    /// Current controls
    pub fn state(&self) -> ClockState {
        *self.state.borrow()
    }

    /// Pause at the next await boundary of every running scenario
    pub fn pause(&self) {
        self.state.send_modify(|s| s.paused = true);
    }

    /// Resume paused scenarios
    pub fn play(&self) {
        self.state.send_modify(|s| s.paused = false);
    }

    /// Whether the clock is paused
    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    /// Set the speed factor. Callers clamp it to the configured bounds.
    pub fn set_speed(&self, factor: f64) {
        if factor > 0.0 {
            self.state.send_modify(|s| s.speed = factor);
        }
    }

    /// Current speed factor
    pub fn speed(&self) -> f64 {
        self.state.borrow().speed
    }

    /// Stop every token issued so far. Returns the new generation.
    ///
    /// A stop also clears the pause flag so stopped work can unwind.
    pub fn stop(&self) -> u64 {
        let mut generation = 0;
        self.state.send_modify(|s| {
            s.stop_generation += 1;
            s.paused = false;
            generation = s.stop_generation;
        });
        generation
    }

    /// Issue a token bound to the current stop generation
    pub fn token(&self) -> RunToken {
        RunToken {
            generation: self.state.borrow().stop_generation,
            rx: self.state.subscribe(),
        }
    }

    /// Scale a simulated duration by the current speed
    pub fn scaled(&self, ms: u64) -> Duration {
        scale(ms, self.speed())
    }

    /// Milliseconds since the clock was created
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl Default for SimulationClock {
    fn default() -> Self {
        Self::new()
    }
}

fn scale(ms: u64, speed: f64) -> Duration {
    if speed > 0.0 {
        Duration::from_secs_f64((ms as f64 / speed).max(0.0) / 1000.0)
    } else {
        Duration::from_millis(ms)
    }
}

/// Pause/cancellation token threaded through every suspendable operation
#[derive(Debug, Clone)]
pub struct RunToken {
    rx: watch::Receiver<ClockState>,
    generation: u64,
}

impl RunToken {
    /// Whether the issuing clock has been stopped since this token was issued
    pub fn is_stopped(&self) -> bool {
        self.rx.borrow().stop_generation > self.generation
    }

    /// Fail with [`EngineError::Stopped`] if stopped
    pub fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            Err(EngineError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Await boundary: block while paused, fail if stopped
    pub async fn checkpoint(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        loop {
            let state = *rx.borrow_and_update();
            if state.stop_generation > self.generation {
                return Err(EngineError::Stopped);
            }
            if !state.paused {
                return Ok(());
            }
            rx.changed().await.map_err(|_| EngineError::Stopped)?;
        }
    }

    /// Sleep `ms` simulated milliseconds, scaled by the speed at the time of the call
    pub async fn sleep(&self, ms: u64) -> Result<()> {
        self.checkpoint().await?;
        let duration = scale(ms, self.rx.borrow().speed);
        self.guard(tokio::time::sleep(duration)).await?;
        self.checkpoint().await
    }

    /// Run `fut` to completion unless the token is stopped first
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.stopped() => Err(EngineError::Stopped),
            output = fut => Ok(output),
        }
    }

    /// Resolves once the token is stopped
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        loop {
            if rx.borrow_and_update().stop_generation > self.generation {
                return;
            }
            if rx.changed().await.is_err() {
                // Clock dropped: nothing can stop us any more
                std::future::pending::<()>().await;
            }
        }
    }
}
