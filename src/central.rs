//! The asynchronous runner around the [`Orchestrator`].

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use futures_lite::StreamExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::orchestrator::{Action, Orchestrator, Phase, State};
use crate::{Adapter, Event, Record, Result};

/// Receives the records produced by a discovery cycle.
#[async_trait]
pub trait RecordSink: Send {
    /// Takes ownership of one finished record.
    async fn submit(&mut self, record: Record) -> Result<()>;
}

/// How a call to [`Central::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The connection closed
    Disconnected {
        /// Records accepted by the sink
        published: usize,
        /// Records the sink failed to accept
        failed: usize,
    },
    /// The cycle was abandoned
    Aborted(ErrorKind),
    /// The scan ended without a match, or no cycle was running
    ScanEnded,
    /// The event stream ended before the cycle did
    EventsExhausted,
}

/// Executes the orchestrator's actions against an [`Adapter`] and a [`RecordSink`].
///
/// Synchronous request failures are fed back to the orchestrator as [`Event::RequestFailed`]. While a phase is
/// active, [`run`][Central::run] injects [`Event::WatchdogExpired`] once the phase's budget has elapsed.
#[derive(Debug)]
pub struct Central<A, S> {
    adapter: A,
    sink: S,
    orchestrator: Orchestrator,
    config: Config,
    published: usize,
    publish_failures: usize,
}

impl<A, S> Central<A, S>
where
    A: Adapter + Send,
    S: RecordSink,
{
    /// Creates a runner. Fails if `config` does not validate.
    pub fn new(adapter: A, sink: S, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Central {
            adapter,
            sink,
            orchestrator: Orchestrator::new(&config),
            config,
            published: 0,
            publish_failures: 0,
        })
    }

    /// The state machine.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// The radio adapter.
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// The radio adapter.
    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    /// The record sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Records accepted by the sink in the current cycle.
    pub fn published(&self) -> usize {
        self.published
    }

    /// Records the sink failed to accept in the current cycle.
    pub fn publish_failures(&self) -> usize {
        self.publish_failures
    }

    /// Starts a discovery cycle. Fails if one is already running.
    pub async fn start(&mut self) -> Result<()> {
        let state = self.orchestrator.state();
        if state != State::Idle && !state.is_terminal() {
            return Err(Error::with_message(
                ErrorKind::AlreadyConnecting,
                format!("discovery cycle already running ({state:?})"),
            ));
        }
        self.published = 0;
        self.publish_failures = 0;
        let actions = self.orchestrator.start();
        self.execute(actions).await;
        Ok(())
    }

    /// Starts the next cycle once the previous one ended.
    pub async fn restart(&mut self) -> Result<()> {
        info!(previous = ?self.orchestrator.state(), "restarting discovery");
        self.start().await
    }

    /// Handles one event and everything it causes.
    pub async fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let actions = self.orchestrator.handle_event(event, &self.adapter);
            queue.extend(self.perform(actions).await);
        }
    }

    /// Feeds `events` into the orchestrator until the cycle ends.
    pub async fn run<St>(&mut self, mut events: St) -> Outcome
    where
        St: Stream<Item = Event> + Unpin,
    {
        let mut watchdog: Option<(Phase, Instant)> = None;
        loop {
            if let Some(outcome) = self.outcome() {
                info!(?outcome, "cycle finished");
                return outcome;
            }

            watchdog = match (self.guarded_phase(), watchdog) {
                (Some(phase), Some((armed, deadline))) if phase == armed => Some((armed, deadline)),
                (Some(phase), _) => {
                    let budget = self.budget(phase);
                    debug!(?phase, ?budget, "watchdog armed");
                    Some((phase, Instant::now() + budget))
                }
                (None, _) => None,
            };

            let event = match watchdog {
                Some((phase, deadline)) => match tokio::time::timeout_at(deadline, events.next()).await {
                    Ok(event) => event,
                    Err(_) => {
                        warn!(?phase, "watchdog expired");
                        watchdog = None;
                        Some(Event::WatchdogExpired { phase })
                    }
                },
                None => events.next().await,
            };

            match event {
                Some(event) => self.dispatch(event).await,
                None => {
                    warn!(state = ?self.orchestrator.state(), "event stream ended");
                    return Outcome::EventsExhausted;
                }
            }
        }
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        let failures = self.perform(actions).await;
        for event in failures {
            self.dispatch(event).await;
        }
    }

    /// Performs `actions` in order and returns the failure events for requests the adapter refused.
    async fn perform(&mut self, actions: Vec<Action>) -> Vec<Event> {
        let mut failures = Vec::new();
        for action in actions {
            match action {
                Action::Request(request) => {
                    debug!(%request, "issuing request");
                    if let Err(err) = request.execute(&mut self.adapter) {
                        error!(%request, %err, "request refused");
                        failures.push(Event::RequestFailed {
                            request,
                            error: err.kind(),
                        });
                    }
                }
                Action::Emit(record) => match self.sink.submit(record).await {
                    Ok(()) => self.published += 1,
                    Err(err) => {
                        self.publish_failures += 1;
                        error!(%err, "failed to publish record");
                    }
                },
            }
        }
        failures
    }

    fn outcome(&self) -> Option<Outcome> {
        match self.orchestrator.state() {
            State::Disconnected => Some(Outcome::Disconnected {
                published: self.published,
                failed: self.publish_failures,
            }),
            State::Aborted(kind) => Some(Outcome::Aborted(kind)),
            State::Idle => Some(Outcome::ScanEnded),
            _ => None,
        }
    }

    fn guarded_phase(&self) -> Option<Phase> {
        let state = self.orchestrator.state();
        if state == State::Publishing && self.config.discovery.linger {
            return None;
        }
        state.phase()
    }

    fn budget(&self, phase: Phase) -> Duration {
        let secs = match phase {
            Phase::Connect => self.config.watchdog.connect_secs,
            Phase::Discovery => self.config.watchdog.discovery_secs,
            Phase::Aggregation => self.config.watchdog.aggregation_secs,
        };
        Duration::from_secs(secs)
    }
}
