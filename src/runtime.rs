use crate::config::{Config, EvaluationConfig};
use crate::evaluator::{Evaluator, Phase, StartOutcome};
use crate::events::{Event, Notification};
use crate::population::GenerationStats;
use crate::recorder::{Recorder, TrajectoryRecorder};
use crate::scoring::ScoringClient;
use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::{io, time::Duration};
use tokio::{
    sync::{
        broadcast::{self, error::TryRecvError},
        mpsc::{self, UnboundedReceiver, UnboundedSender},
    },
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

/// Buffered notifications before slow subscribers start lagging.
const NOTIFICATION_CAPACITY: usize = 256;

enum Wake {
    Tick,
    Event(Event),
    Deadline,
}

pub struct Runtime<R: Recorder> {
    evaluator: Evaluator,
    notifications: broadcast::Receiver<Notification>,
    recorder: R,
    scoring: Option<ScoringClient>,
    events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,
    health_poll: Option<JoinHandle<()>>,
    stop_on_interrupt: bool,
    interrupt: Option<JoinHandle<()>>,
    tick: Duration,
    dt: f64,
    health_interval: Duration,
}

impl Runtime<TrajectoryRecorder> {
    /// Wire an evaluator to a trajectory recorder and, when configured, the
    /// scoring service.
    pub fn build(cfg: Config, trace: Option<TraceWriter>) -> Result<Self> {
        let scoring = cfg
            .server
            .as_ref()
            .map(ScoringClient::new)
            .transpose()
            .context("failed to construct scoring client")?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = broadcast::channel(NOTIFICATION_CAPACITY);

        let recorder = TrajectoryRecorder::new(
            cfg.evaluation.frames_per_segment,
            events_tx.clone(),
            scoring.clone(),
        );
        let evaluation = cfg.evaluation.clone();
        let evaluator =
            Evaluator::new(cfg, trace, notify_tx).context("failed to construct evaluator")?;

        let mut runtime = Self::new(
            evaluator,
            notify_rx,
            recorder,
            scoring,
            (events_tx, events_rx),
            &evaluation,
        );
        runtime.stop_on_interrupt = true;
        Ok(runtime)
    }
}

impl<R: Recorder> Runtime<R> {
    pub fn new(
        evaluator: Evaluator,
        notifications: broadcast::Receiver<Notification>,
        recorder: R,
        scoring: Option<ScoringClient>,
        events: (UnboundedSender<Event>, UnboundedReceiver<Event>),
        cfg: &EvaluationConfig,
    ) -> Self {
        let (events_tx, events_rx) = events;
        Self {
            evaluator,
            notifications,
            recorder,
            scoring,
            events_tx,
            events_rx,
            health_poll: None,
            stop_on_interrupt: false,
            interrupt: None,
            tick: cfg.tick(),
            dt: cfg.tick_secs(),
            health_interval: cfg.health_poll_interval(),
        }
    }

    /// Run until the last generation completes, a stop is requested, or the
    /// evaluator idles with auto-run disabled. Returns the generation history.
    pub async fn run(mut self) -> Result<Vec<GenerationStats>> {
        if self.stop_on_interrupt {
            self.interrupt = Some(spawn_stop_on(
                tokio::signal::ctrl_c(),
                self.events_tx.clone(),
            ));
        }
        self.start().context("failed to start evaluation")?;

        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.dispatch_notifications();
            if !self.evaluator.is_running() {
                break;
            }

            let deadline = self.evaluator.score_deadline();
            let wake = tokio::select! {
                _ = ticker.tick() => Wake::Tick,
                Some(event) = self.events_rx.recv() => Wake::Event(event),
                _ = sleep_until(deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Tick => self.on_tick(),
                Wake::Event(event) => self.on_event(event),
                Wake::Deadline => {
                    self.evaluator.expire_score_timer(Instant::now());
                }
            }

            if self.evaluator.phase() == Phase::AdvancingIndividual {
                if let Err(error) = self.evaluator.advance(Instant::now()) {
                    log::error!("failed to advance evaluation: {error:#}");
                    self.evaluator.stop();
                }
            }
        }

        self.shutdown();
        if self.evaluator.is_finished() {
            log::info!("evaluation finished");
        }
        Ok(self.evaluator.history().to_vec())
    }

    fn start(&mut self) -> Result<()> {
        match self.evaluator.start_evaluation(Instant::now())? {
            StartOutcome::AwaitingServer => self.spawn_health_poll(),
            StartOutcome::Started => {}
            StartOutcome::Rejected => log::warn!("nothing to evaluate"),
        }
        Ok(())
    }

    fn spawn_health_poll(&mut self) {
        if self.health_poll.is_some() {
            return;
        }
        if let Some(scoring) = &self.scoring {
            log::debug!("polling scoring service health every {:?}", self.health_interval);
            self.health_poll =
                Some(scoring.spawn_health_poll(self.health_interval, self.events_tx.clone()));
        }
    }

    fn on_tick(&mut self) {
        let Some(report) = self.evaluator.tick(self.dt) else {
            return;
        };
        if report.collisions > 0 {
            log::debug!("{} collisions", report.collisions);
        }
        if self.evaluator.is_recording() {
            self.recorder.capture(self.evaluator.world().agents());
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::ServerReady => {
                self.health_poll = None;
                if let Err(error) = self.evaluator.mark_server_ready(Instant::now()) {
                    log::error!("failed to start after server became ready: {error:#}");
                    self.evaluator.stop();
                }
            }
            Event::SegmentCompleted { episode, frames } => {
                self.evaluator.segment_completed(episode, frames);
            }
            Event::ScoreReceived { episode, score } => {
                if !self.evaluator.receive_score(episode, score) {
                    log::debug!(
                        "ignoring score {score} for episode {episode} (live: {:?}, phase: {:?})",
                        self.evaluator.active_episode(),
                        self.evaluator.phase()
                    );
                }
            }
            Event::Stop => {
                log::info!(
                    "stop requested at generation {} individual {}",
                    self.evaluator.generation(),
                    self.evaluator.current_individual()
                );
                self.evaluator.set_auto_run(false);
            }
        }
    }

    /// Forward evaluator notifications to the recorder.
    fn dispatch_notifications(&mut self) {
        loop {
            match self.notifications.try_recv() {
                Ok(Notification::EvaluationStarted {
                    generation,
                    individual,
                    episode,
                }) => self.recorder.start_recording(episode, generation, individual),
                Ok(Notification::EvaluationStopped) => self.recorder.stop_recording(),
                Ok(Notification::GenerationCompleted(_) | Notification::Finished) => {}
                Err(TryRecvError::Lagged(n_skipped)) => {
                    log::warn!("skipped {n_skipped} notifications");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return,
            }
        }
    }

    fn shutdown(&mut self) {
        for handle in [self.health_poll.take(), self.interrupt.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        self.recorder.stop_recording();
    }
}

/// Send [`Event::Stop`] once `signal` resolves.
fn spawn_stop_on<F>(signal: F, events: UnboundedSender<Event>) -> JoinHandle<()>
where
    F: Future<Output = io::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                log::warn!("interrupted, stopping evaluation");
                events.send(Event::Stop).ok();
            }
            Err(error) => log::warn!("failed to listen for interrupts: {error}"),
        }
    })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
