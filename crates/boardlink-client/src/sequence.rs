//! Scripted pin sequences.
//!
//! A [`Sequence`] is a JSON document listing steps to run against a board,
//! repeated for a number of cycles:
//!
//! ```json
//! {
//!   "name": "blink-and-wait",
//!   "cycles": 3,
//!   "steps": [
//!     {"action": "SET_HIGH", "pin": "D13", "wait": 200},
//!     {"action": "WAIT_FOR_PIN", "pin": "D2", "value": "HIGH", "timeout": 2000},
//!     {"action": "SET_LOW", "pin": "D13"},
//!     {"action": "WAIT", "wait": 500}
//!   ]
//! }
//! ```
//!
//! `cycles: 0` repeats until the runner is stopped. Before the first cycle
//! every pin driven by a `SET_*` step is switched to `OUTPUT`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use boardlink_core::error::{Error, Result};
use boardlink_core::events::{BoardEvent, EventTag};
use boardlink_core::types::{PinMode, PinName};

use crate::client::BoardClient;
use crate::fanout::Subscription;

/// How often `WAIT_FOR_PIN` polls with `digital_read`.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn default_cycles() -> u32 {
    1
}

fn default_set_wait() -> u64 {
    100
}

fn default_pin_timeout() -> u64 {
    5000
}

/// A digital level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Level {
    #[default]
    High,
    Low,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    fn matches(self, value: i64) -> bool {
        (value != 0) == self.is_high()
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::High => "HIGH",
            Level::Low => "LOW",
        })
    }
}

/// One step of a sequence. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    /// Drive `pin` high, then pause for `wait`.
    SetHigh {
        pin: PinName,
        #[serde(default = "default_set_wait")]
        wait: u64,
    },
    /// Drive `pin` low, then pause for `wait`.
    SetLow {
        pin: PinName,
        #[serde(default = "default_set_wait")]
        wait: u64,
    },
    /// Pause.
    Wait {
        #[serde(alias = "value")]
        wait: u64,
    },
    /// Block until `pin` reads `value`, failing after `timeout`.
    WaitForPin {
        pin: PinName,
        #[serde(default)]
        value: Level,
        #[serde(default = "default_pin_timeout")]
        timeout: u64,
    },
}

impl Step {
    fn action(&self) -> &'static str {
        match self {
            Step::SetHigh { .. } => "SET_HIGH",
            Step::SetLow { .. } => "SET_LOW",
            Step::Wait { .. } => "WAIT",
            Step::WaitForPin { .. } => "WAIT_FOR_PIN",
        }
    }

    fn pin(&self) -> Option<PinName> {
        match self {
            Step::SetHigh { pin, .. } | Step::SetLow { pin, .. } | Step::WaitForPin { pin, .. } => {
                Some(*pin)
            }
            Step::Wait { .. } => None,
        }
    }
}

/// A named list of steps and a repeat count.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Sequence {
    #[serde(default)]
    pub name: String,
    /// Number of cycles; `0` runs until stopped.
    #[serde(default = "default_cycles")]
    pub cycles: u32,
    pub steps: Vec<Step>,
}

impl Sequence {
    /// Parse a sequence document.
    pub fn from_json(text: &str) -> Result<Self> {
        let seq: Sequence = serde_json::from_str(text)?;
        if seq.steps.is_empty() {
            return Err(Error::InvalidParameter("sequence has no steps".into()));
        }
        Ok(seq)
    }

    fn output_pins(&self) -> BTreeSet<PinName> {
        self.steps
            .iter()
            .filter_map(|s| match s {
                Step::SetHigh { pin, .. } | Step::SetLow { pin, .. } => Some(*pin),
                _ => None,
            })
            .collect()
    }
}

/// One executed step.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Time since the run started.
    pub elapsed: Duration,
    /// 1-based cycle number.
    pub cycle: u32,
    pub pin: Option<PinName>,
    pub action: &'static str,
    /// What happened, e.g. `HIGH`, `300ms`, `reached LOW`.
    pub detail: String,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceOutcome {
    /// Every cycle ran.
    Completed,
    /// The cancellation token fired.
    Stopped,
    /// A `WAIT_FOR_PIN` step did not see its level in time.
    Timeout { pin: PinName },
    /// A board command failed.
    Failed(String),
}

/// Result of [`SequenceRunner::run`].
#[derive(Debug, Clone)]
pub struct SequenceReport {
    pub name: String,
    pub cycles_completed: u32,
    pub outcome: SequenceOutcome,
    pub log: Vec<LogEntry>,
    /// Wall time of each completed cycle.
    pub cycle_times: Vec<Duration>,
}

/// Progress notifications sent while a sequence runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    CycleStarted { cycle: u32 },
    Step(LogEntry),
    CycleFinished { cycle: u32, duration: Duration },
}

enum StepError {
    Stopped,
    Timeout(PinName),
    Failed(String),
}

impl From<Error> for StepError {
    fn from(e: Error) -> Self {
        StepError::Failed(e.to_string())
    }
}

type StepResult<T = ()> = std::result::Result<T, StepError>;

/// Runs [`Sequence`]s against a board.
pub struct SequenceRunner {
    client: Arc<BoardClient>,
    cancel: CancellationToken,
    progress: Option<mpsc::UnboundedSender<Progress>>,
}

impl SequenceRunner {
    pub fn new(client: Arc<BoardClient>, cancel: CancellationToken) -> Self {
        SequenceRunner {
            client,
            cancel,
            progress: None,
        }
    }

    /// Send [`Progress`] updates to `tx` while running.
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<Progress>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Stop a run in progress. The current step is interrupted.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn notify(&self, progress: Progress) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(progress);
        }
    }

    /// Run `seq` to completion, stop, or first failure.
    pub async fn run(&self, seq: &Sequence) -> SequenceReport {
        let started = Instant::now();
        let mut report = SequenceReport {
            name: seq.name.clone(),
            cycles_completed: 0,
            outcome: SequenceOutcome::Completed,
            log: Vec::new(),
            cycle_times: Vec::new(),
        };
        tracing::info!(name = %seq.name, cycles = seq.cycles, steps = seq.steps.len(), "sequence started");

        // Subscribe before the first command so no pin_update is missed.
        let mut pins = self.client.subscribe(&[EventTag::PinUpdate]);

        let result = self.run_cycles(seq, started, &mut pins, &mut report).await;
        report.outcome = match result {
            Ok(()) => SequenceOutcome::Completed,
            Err(StepError::Stopped) => SequenceOutcome::Stopped,
            Err(StepError::Timeout(pin)) => SequenceOutcome::Timeout { pin },
            Err(StepError::Failed(reason)) => SequenceOutcome::Failed(reason),
        };

        tracing::info!(
            name = %seq.name,
            cycles = report.cycles_completed,
            outcome = ?report.outcome,
            "sequence finished"
        );
        report
    }

    async fn run_cycles(
        &self,
        seq: &Sequence,
        started: Instant,
        pins: &mut Subscription,
        report: &mut SequenceReport,
    ) -> StepResult {
        for pin in seq.output_pins() {
            self.guard(self.client.pin_mode(pin, PinMode::Output)).await??;
        }

        let mut cycle = 0u32;
        while seq.cycles == 0 || cycle < seq.cycles {
            cycle += 1;
            let cycle_start = Instant::now();
            self.notify(Progress::CycleStarted { cycle });
            tracing::debug!(cycle, "cycle started");

            for step in &seq.steps {
                let detail = self.run_step(step, pins).await?;
                let entry = LogEntry {
                    elapsed: started.elapsed(),
                    cycle,
                    pin: step.pin(),
                    action: step.action(),
                    detail,
                };
                self.notify(Progress::Step(entry.clone()));
                report.log.push(entry);
            }

            let duration = cycle_start.elapsed();
            report.cycles_completed = cycle;
            report.cycle_times.push(duration);
            self.notify(Progress::CycleFinished { cycle, duration });
        }
        Ok(())
    }

    async fn run_step(&self, step: &Step, pins: &mut Subscription) -> StepResult<String> {
        match *step {
            Step::SetHigh { pin, wait } => {
                self.guard(self.client.digital_write(pin, true)).await??;
                self.pause(wait).await?;
                Ok(Level::High.to_string())
            }
            Step::SetLow { pin, wait } => {
                self.guard(self.client.digital_write(pin, false)).await??;
                self.pause(wait).await?;
                Ok(Level::Low.to_string())
            }
            Step::Wait { wait } => {
                self.pause(wait).await?;
                Ok(format!("{wait}ms"))
            }
            Step::WaitForPin {
                pin,
                value,
                timeout,
            } => {
                let waited = self
                    .wait_for_pin(pin, value, Duration::from_millis(timeout), pins)
                    .await?;
                Ok(format!("reached {value} after {}ms", waited.as_millis()))
            }
        }
    }

    /// Run `fut` unless the token fires first.
    async fn guard<F: Future>(&self, fut: F) -> StepResult<F::Output> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StepError::Stopped),
            out = fut => Ok(out),
        }
    }

    async fn pause(&self, ms: u64) -> StepResult {
        if ms == 0 {
            return Ok(());
        }
        self.guard(tokio::time::sleep(Duration::from_millis(ms))).await
    }

    async fn wait_for_pin(
        &self,
        pin: PinName,
        level: Level,
        timeout: Duration,
        pins: &mut Subscription,
    ) -> StepResult<Duration> {
        let start = Instant::now();
        let deadline = start + timeout;
        let pin_name = pin.to_string();

        // Updates from earlier steps say nothing about the level from now on.
        pins.drain();

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StepError::Stopped),
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::debug!(pin = %pin, level = %level, "wait for pin timed out");
                    return Err(StepError::Timeout(pin));
                }
                event = pins.recv() => match event {
                    Some(BoardEvent::PinUpdate(update))
                        if update.pin_name == pin_name && level.matches(update.value) =>
                    {
                        return Ok(start.elapsed());
                    }
                    Some(_) => {}
                    None => return Err(StepError::Failed("event stream closed".into())),
                },
                _ = poll.tick() => {
                    let read = self
                        .guard(tokio::time::timeout_at(deadline, self.client.digital_read(pin)))
                        .await?;
                    match read {
                        Ok(Ok(high)) if high == level.is_high() => return Ok(start.elapsed()),
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) if e.is_session_fatal() => return Err(e.into()),
                        Ok(Err(e)) => tracing::debug!(pin = %pin, error = %e, "poll failed"),
                        Err(_) => {
                            tracing::debug!(pin = %pin, level = %level, "wait for pin timed out");
                            return Err(StepError::Timeout(pin));
                        }
                    }
                }
            }
        }
    }
}
