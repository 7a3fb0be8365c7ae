use std::sync::{Arc, Condvar, Mutex, PoisonError, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::domain::cluster::local_cluster::ClusterCore;
use crate::domain::utils::id::ComponentId;
use crate::domain::utils::sync::lock;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct ClockState {
    time: u64,
    stopped: bool,
}

/// Counts elapsed tick periods and wakes the countdown thread.
#[derive(Debug, Default)]
pub(crate) struct TickClock {
    state: Mutex<ClockState>,
    advanced: Condvar,
}

impl TickClock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Tick periods elapsed so far.
    pub(crate) fn now(&self) -> u64 {
        lock(&self.state).time
    }

    fn advance(&self) {
        lock(&self.state).time += 1;
        self.advanced.notify_all();
    }

    pub(crate) fn stop(&self) {
        lock(&self.state).stopped = true;
        self.advanced.notify_all();
    }

    /// Blocks until the clock moves past `seen`. `None` once stopped.
    fn wait_past(&self, seen: u64) -> Option<u64> {
        let state = lock(&self.state);
        let state = self.advanced.wait_while(state, |s| s.time <= seen && !s.stopped).unwrap_or_else(PoisonError::into_inner);
        if state.stopped { None } else { Some(state.time) }
    }
}

/// Per-bolt countdown in tick periods.
#[derive(Debug, Clone)]
pub(crate) struct TickCountdown {
    pub(crate) component: ComponentId,
    pub(crate) interval: u64,
    pub(crate) remaining: u64,
}

impl TickCountdown {
    pub(crate) fn new(component: ComponentId, interval: u64) -> Self {
        let interval = interval.max(1);
        Self { component, interval, remaining: interval }
    }

    /// Advances one period; true when a tick is due.
    fn step(&mut self) -> bool {
        self.remaining -= 1;
        if self.remaining == 0 {
            self.remaining = self.interval;
            true
        } else {
            false
        }
    }
}

/// Starts the wall-clock thread and the countdown thread. Dropping the
/// returned sender stops both.
pub(crate) fn spawn_tick_threads(core: &Arc<ClusterCore>, mut countdowns: Vec<TickCountdown>, period: Duration) -> Result<(mpsc::Sender<()>, Vec<JoinHandle<()>>)> {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let topology = core.topology_id.clone();

    let clock = core.clock.clone();
    let timer_name = format!("tick-{}", topology);
    let timer = thread::Builder::new()
        .name(timer_name.clone())
        .spawn(move || {
            loop {
                match stop_rx.recv_timeout(period) {
                    Err(mpsc::RecvTimeoutError::Timeout) => clock.advance(),
                    _ => break,
                }
            }
            clock.stop();
        })
        .map_err(|source| Error::ThreadSpawnError { name: timer_name, source })?;

    let counter_core = core.clone();
    let counter_name = format!("tick-counter-{}", topology);
    let counter = thread::Builder::new()
        .name(counter_name.clone())
        .spawn(move || {
            let mut counted = 0u64;
            while let Some(now) = counter_core.clock.wait_past(counted) {
                while counted < now {
                    counted += 1;
                    for countdown in countdowns.iter_mut() {
                        if countdown.step() {
                            counter_core.issue_tick(&countdown.component);
                        }
                    }
                }
            }
            log::debug!("Tick counter of {} stopped", counter_core.topology_id);
        });

    let counter = match counter {
        Ok(handle) => handle,
        Err(source) => {
            drop(stop_tx);
            let _ = timer.join();
            return Err(Error::ThreadSpawnError { name: counter_name, source });
        }
    };

    Ok((stop_tx, vec![timer, counter]))
}
