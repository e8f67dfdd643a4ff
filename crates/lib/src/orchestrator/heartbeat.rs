//! Keep-alive output for CI systems that kill silent jobs.

use std::io::IsTerminal;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

/// A background task that logs a line every `period` until stopped.
#[derive(Debug)]
pub struct Heartbeat {
  shutdown: watch::Sender<bool>,
  task: JoinHandle<u64>,
}

impl Heartbeat {
  pub fn start(period: Duration) -> Self {
    let (shutdown, mut stopped) = watch::channel(false);
    let started = Instant::now();

    let task = tokio::spawn(async move {
      let mut interval = tokio::time::interval_at(started + period, period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      let mut ticks = 0u64;
      loop {
        tokio::select! {
          _ = interval.tick() => {
            ticks += 1;
            let elapsed = Duration::from_secs(started.elapsed().as_secs());
            info!(elapsed = %humantime::format_duration(elapsed), "still building");
          }
          changed = stopped.changed() => {
            if changed.is_err() || *stopped.borrow() {
              break;
            }
          }
        }
      }
      ticks
    });

    Self { shutdown, task }
  }

  /// Start only when stderr is not a terminal. A zero period disables it.
  pub fn start_if_noninteractive(period: Duration) -> Option<Self> {
    if period.is_zero() || std::io::stderr().is_terminal() {
      None
    } else {
      Some(Self::start(period))
    }
  }

  /// Signal the task and wait for it. Returns how many beats were logged.
  pub async fn stop(self) -> u64 {
    let _ = self.shutdown.send(true);
    match self.task.await {
      Ok(ticks) => ticks,
      Err(e) => {
        debug!(error = %e, "heartbeat task ended abnormally");
        0
      }
    }
  }
}
