//! Generation / individual state machine.

use crate::config::Config;
use crate::events::{EpisodeId, Notification};
use crate::evolution;
use crate::geometry::Vec3;
use crate::model::{TickReport, World};
use crate::population::{GenerationStats, Population};
use crate::spawn::ArenaSpawner;
use crate::trace::TraceWriter;
use anyhow::{Context, Result, bail};
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingServerReady,
    PreparingIndividual,
    SimulatingAndRecording,
    AwaitingScore,
    AdvancingIndividual,
    CompletingGeneration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AwaitingServer,
    Rejected,
}

/// Live evaluation of one individual.
#[derive(Debug, Clone, Copy)]
struct Session {
    episode: EpisodeId,
    individual: usize,
    deadline: Instant,
}

pub struct Evaluator {
    cfg: Config,
    rng: ChaCha12Rng,
    population: Population,
    world: World,
    spawner: ArenaSpawner,
    phase: Phase,
    generation: usize,
    individual: usize,
    session: Option<Session>,
    last_episode: u64,
    server_ready: bool,
    auto_run: bool,
    finished: bool,
    individuals_logged: bool,
    history: Vec<GenerationStats>,
    trace: Option<TraceWriter>,
    notifications: broadcast::Sender<Notification>,
}

impl Evaluator {
    pub fn new(
        cfg: Config,
        trace: Option<TraceWriter>,
        notifications: broadcast::Sender<Notification>,
    ) -> Result<Self> {
        let mut rng = match cfg.evolution.seed {
            Some(seed) => ChaCha12Rng::seed_from_u64(seed),
            None => ChaCha12Rng::try_from_os_rng().context("failed to seed rng")?,
        };

        let population = Population::random(cfg.evolution.population_size, &mut rng);
        let genes = population
            .get(0)
            .map(|ind| Arc::clone(ind.shared_genes()))
            .context("population is empty")?;
        let world = World::new(&cfg.flock, &cfg.force, genes);
        let spawner = ArenaSpawner::new(
            Vec3::ZERO,
            cfg.flock.arena_radius,
            cfg.flock.agent_radius,
            world.obstacles().to_vec(),
        );

        Ok(Self {
            server_ready: cfg.server.is_none(),
            auto_run: cfg.evolution.auto_run,
            cfg,
            rng,
            population,
            world,
            spawner,
            phase: Phase::Idle,
            generation: 0,
            individual: 0,
            session: None,
            last_episode: 0,
            finished: false,
            individuals_logged: false,
            history: Vec::new(),
            trace,
            notifications,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn current_individual(&self) -> usize {
        self.individual
    }

    #[cfg(test)]
    pub fn population(&self) -> &Population {
        &self.population
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn history(&self) -> &[GenerationStats] {
        &self.history
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_running(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn is_recording(&self) -> bool {
        self.phase == Phase::SimulatingAndRecording
    }

    pub fn active_episode(&self) -> Option<EpisodeId> {
        self.session.map(|s| s.episode)
    }

    /// Deadline of the armed score timer, if any.
    pub fn score_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::SimulatingAndRecording | Phase::AwaitingScore => {
                self.session.map(|s| s.deadline)
            }
            _ => None,
        }
    }

    pub fn set_auto_run(&mut self, enabled: bool) {
        self.auto_run = enabled;
        if !enabled && self.is_running() {
            self.stop();
        }
    }

    /// Begin (or resume) evaluating the current generation.
    pub fn start_evaluation(&mut self, now: Instant) -> Result<StartOutcome> {
        match self.phase {
            Phase::Idle | Phase::AwaitingServerReady => {}
            phase => {
                log::warn!("evaluation already in progress ({phase:?}); start rejected");
                return Ok(StartOutcome::Rejected);
            }
        }
        if self.finished {
            log::warn!("all {} generations evaluated; start rejected", self.generation + 1);
            return Ok(StartOutcome::Rejected);
        }
        if !self.server_ready {
            if self.phase != Phase::AwaitingServerReady {
                log::info!("waiting for scoring service");
                self.phase = Phase::AwaitingServerReady;
            }
            return Ok(StartOutcome::AwaitingServer);
        }

        self.begin_generation(now)?;
        Ok(StartOutcome::Started)
    }

    /// Record that the scoring service is reachable, proceeding if a start was
    /// waiting on it.
    pub fn mark_server_ready(&mut self, now: Instant) -> Result<StartOutcome> {
        if !self.server_ready {
            log::info!("scoring service is ready");
        }
        self.server_ready = true;
        if self.phase == Phase::AwaitingServerReady {
            self.start_evaluation(now)
        } else {
            Ok(StartOutcome::Rejected)
        }
    }

    fn begin_generation(&mut self, now: Instant) -> Result<()> {
        if !self.individuals_logged {
            if let Some(trace) = &self.trace {
                if let Err(error) = trace.write_individuals(self.generation, &self.population) {
                    log::error!("failed to write individuals trace: {error:#}");
                }
            }
            self.individuals_logged = true;
        }
        log::info!(
            "starting generation {} ({} individuals)",
            self.generation,
            self.population.len()
        );

        match self.population.next_unevaluated(0) {
            Some(i_ind) => self.prepare_individual(i_ind, now),
            None => self.complete_generation(now),
        }
    }

    /// Apply individual `i_ind`'s genes to the flock, respawn it, open a new
    /// session and arm the score timer.
    pub fn prepare_individual(&mut self, i_ind: usize, now: Instant) -> Result<()> {
        let Some(ind) = self.population.get(i_ind) else {
            bail!("individual {i_ind} out of range");
        };
        if ind.is_evaluated() {
            bail!("individual {i_ind} already evaluated in generation {}", self.generation);
        }
        let genes = Arc::clone(ind.shared_genes());

        self.phase = Phase::PreparingIndividual;
        self.world.apply_genes(&genes);
        let failures = self.world.respawn(
            &self.spawner,
            self.cfg.evaluation.spawn_attempts,
            &mut self.rng,
        );
        if failures > 0 {
            log::warn!("{failures} agents placed without collision check");
        }

        self.last_episode += 1;
        let episode = EpisodeId(self.last_episode);
        self.individual = i_ind;
        self.session = Some(Session {
            episode,
            individual: i_ind,
            deadline: now + self.cfg.evaluation.score_timeout(),
        });
        self.phase = Phase::SimulatingAndRecording;

        log::debug!(
            "generation {} individual {i_ind} episode {episode}: {}",
            self.generation,
            genes
        );
        self.notify(Notification::EvaluationStarted {
            generation: self.generation,
            individual: i_ind,
            episode,
        });
        Ok(())
    }

    /// Advance the flock one tick while an individual is being simulated.
    pub fn tick(&mut self, dt: f64) -> Option<TickReport> {
        match self.phase {
            Phase::SimulatingAndRecording | Phase::AwaitingScore => Some(self.world.step(dt)),
            _ => None,
        }
    }

    pub fn segment_completed(&mut self, episode: EpisodeId, frames: usize) -> bool {
        let live = self.session.is_some_and(|s| s.episode == episode);
        if !live || self.phase != Phase::SimulatingAndRecording {
            log::debug!("ignoring segment of episode {episode}");
            return false;
        }
        log::debug!("episode {episode} recorded {frames} frames; awaiting score");
        self.phase = Phase::AwaitingScore;
        true
    }

    /// Store an external score for the live episode.
    ///
    /// Scores for any other episode, or arriving outside `AwaitingScore`, are
    /// ignored.
    pub fn receive_score(&mut self, episode: EpisodeId, score: f64) -> bool {
        let live = self.session.is_some_and(|s| s.episode == episode);
        if !live || self.phase != Phase::AwaitingScore {
            return false;
        }
        let score = if score.is_finite() {
            score.max(0.0)
        } else {
            log::error!("malformed score {score} for episode {episode}; using zero");
            0.0
        };
        log::info!(
            "generation {} individual {} scored {score:.4}",
            self.generation,
            self.individual
        );
        self.record(score)
    }

    /// Fall back to the local fitness proxy if the score deadline has passed.
    pub fn expire_score_timer(&mut self, now: Instant) -> bool {
        let Some(deadline) = self.score_deadline() else {
            return false;
        };
        if now < deadline {
            return false;
        }
        let fallback = self.world.fallback_fitness(&self.cfg.fitness);
        log::warn!(
            "scoring timeout for generation {} individual {}; using fallback fitness {fallback:.4}",
            self.generation,
            self.individual
        );
        self.record(fallback)
    }

    fn record(&mut self, fitness: f64) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };
        match self.population.get_mut(session.individual) {
            Some(ind) => {
                if let Err(error) = ind.record_fitness(fitness) {
                    log::warn!("individual {}: {error:#}", session.individual);
                }
            }
            None => log::error!("session refers to missing individual {}", session.individual),
        }
        self.phase = Phase::AdvancingIndividual;
        true
    }

    /// Move on to the next unevaluated individual, or complete the generation.
    pub fn advance(&mut self, now: Instant) -> Result<()> {
        if self.phase != Phase::AdvancingIndividual {
            return Ok(());
        }
        let next = self
            .population
            .next_unevaluated(self.individual + 1)
            .or_else(|| self.population.next_unevaluated(0));
        match next {
            Some(i_ind) => self.prepare_individual(i_ind, now),
            None => self.complete_generation(now),
        }
    }

    fn complete_generation(&mut self, now: Instant) -> Result<()> {
        self.phase = Phase::CompletingGeneration;

        let stats = self
            .population
            .stats(self.generation)
            .context("failed to compute generation stats")?;
        log::info!(
            "generation {} completed: best {:.4} avg {:.4} [{}]",
            stats.generation,
            stats.best_fitness,
            stats.avg_fitness,
            stats.best_genes
        );
        if let Some(trace) = &self.trace {
            if let Err(error) = trace.write_generation(&stats) {
                log::error!("failed to write generation trace: {error:#}");
            }
        }
        self.history.push(stats.clone());
        self.notify(Notification::GenerationCompleted(stats));

        if self.generation + 1 >= self.cfg.evolution.max_generations {
            log::info!("reached {} generations; halting", self.cfg.evolution.max_generations);
            self.finished = true;
            self.phase = Phase::Idle;
            self.notify(Notification::Finished);
            return Ok(());
        }

        self.population =
            evolution::next_generation(&self.population, &self.cfg.evolution, &mut self.rng)
                .context("failed to breed next generation")?;
        self.generation += 1;
        self.individual = 0;
        self.individuals_logged = false;
        self.phase = Phase::Idle;

        if self.auto_run {
            self.begin_generation(now)?;
        }
        Ok(())
    }

    /// Cancel the pending timer and return to `Idle`. Recorded fitness values
    /// are kept; a later start resumes at the first unevaluated individual.
    pub fn stop(&mut self) {
        if self.phase == Phase::Idle {
            return;
        }
        if let Some(session) = self.session.take() {
            log::info!("stopping; episode {} abandoned", session.episode);
        }
        self.phase = Phase::Idle;
        self.notify(Notification::EvaluationStopped);
    }

    fn notify(&self, notification: Notification) {
        // no subscribers is fine
        let _ = self.notifications.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::offline_config;
    use std::time::Duration;

    fn evaluator(cfg: Config) -> (Evaluator, broadcast::Receiver<Notification>) {
        let (tx, rx) = broadcast::channel(64);
        (Evaluator::new(cfg, None, tx).unwrap(), rx)
    }

    fn online_config() -> Config {
        let mut cfg = offline_config();
        cfg.server = Some(crate::config::ServerConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            request_timeout_ms: 100,
            upload_attempts: 1,
            upload_retry_delay_ms: 10,
        });
        cfg
    }

    fn fitness_values(ev: &Evaluator) -> Vec<f64> {
        ev.population().individuals().iter().map(|i| i.fitness()).collect()
    }

    /// Drive the live episode through recording and scoring.
    fn score_current(ev: &mut Evaluator, score: f64) {
        let episode = ev.active_episode().unwrap();
        assert!(ev.segment_completed(episode, 10));
        assert!(ev.receive_score(episode, score));
    }

    #[tokio::test]
    async fn start_prepares_first_individual_and_notifies() {
        let (mut ev, mut rx) = evaluator(offline_config());
        let now = Instant::now();

        assert_eq!(ev.start_evaluation(now).unwrap(), StartOutcome::Started);
        assert_eq!(ev.phase(), Phase::SimulatingAndRecording);
        assert_eq!(ev.score_deadline(), Some(now + Duration::from_millis(1000)));

        let genes = ev.population().individuals()[0].shared_genes().clone();
        assert!(ev.world().agents().iter().all(|a| Arc::ptr_eq(a.genes(), &genes)));

        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::EvaluationStarted {
                generation: 0,
                individual: 0,
                episode: ev.active_episode().unwrap(),
            }
        );
    }

    #[tokio::test]
    async fn start_is_rejected_while_running() {
        let (mut ev, _rx) = evaluator(offline_config());
        let now = Instant::now();
        ev.start_evaluation(now).unwrap();
        let episode = ev.active_episode();
        assert_eq!(ev.start_evaluation(now).unwrap(), StartOutcome::Rejected);
        assert_eq!(ev.active_episode(), episode);
    }

    #[tokio::test]
    async fn waits_for_server_then_proceeds() {
        let (mut ev, _rx) = evaluator(online_config());
        let now = Instant::now();

        assert_eq!(ev.start_evaluation(now).unwrap(), StartOutcome::AwaitingServer);
        assert_eq!(ev.phase(), Phase::AwaitingServerReady);
        assert_eq!(ev.start_evaluation(now).unwrap(), StartOutcome::AwaitingServer);

        assert_eq!(ev.mark_server_ready(now).unwrap(), StartOutcome::Started);
        assert_eq!(ev.phase(), Phase::SimulatingAndRecording);
    }

    #[tokio::test]
    async fn score_is_clamped_and_advances() {
        let (mut ev, _rx) = evaluator(offline_config());
        let now = Instant::now();
        ev.start_evaluation(now).unwrap();

        score_current(&mut ev, -3.0);
        assert_eq!(ev.phase(), Phase::AdvancingIndividual);
        assert_eq!(ev.population().individuals()[0].fitness(), 0.0);
        assert!(ev.population().individuals()[0].is_evaluated());
        assert_eq!(ev.score_deadline(), None);

        ev.advance(now).unwrap();
        assert_eq!(ev.current_individual(), 1);
        assert_eq!(ev.phase(), Phase::SimulatingAndRecording);
    }

    #[tokio::test]
    async fn stale_episode_does_not_change_fitness() {
        let (mut ev, _rx) = evaluator(offline_config());
        let now = Instant::now();
        ev.start_evaluation(now).unwrap();

        let first = ev.active_episode().unwrap();
        score_current(&mut ev, 0.7);
        ev.advance(now).unwrap();
        let second = ev.active_episode().unwrap();
        assert_ne!(first, second);
        assert!(ev.segment_completed(second, 10));

        let before = fitness_values(&ev);
        assert!(!ev.receive_score(first, 0.1));
        assert!(!ev.receive_score(EpisodeId(second.0 + 100), 0.1));
        assert_eq!(fitness_values(&ev), before);
        assert_eq!(ev.phase(), Phase::AwaitingScore);

        // a duplicate after the live score is also ignored
        assert!(ev.receive_score(second, 0.4));
        assert!(!ev.receive_score(second, 0.9));
        assert_eq!(ev.population().individuals()[1].fitness(), 0.4);
    }

    #[tokio::test]
    async fn score_before_segment_is_ignored() {
        let (mut ev, _rx) = evaluator(offline_config());
        ev.start_evaluation(Instant::now()).unwrap();
        let episode = ev.active_episode().unwrap();
        assert!(!ev.receive_score(episode, 0.5));
        assert!(!ev.population().individuals()[0].is_evaluated());
    }

    #[tokio::test]
    async fn timeout_stores_fallback_fitness() {
        let (mut ev, _rx) = evaluator(offline_config());
        let now = Instant::now();
        ev.start_evaluation(now).unwrap();
        for _ in 0..25 {
            ev.tick(0.02);
        }

        assert!(!ev.expire_score_timer(now + Duration::from_millis(999)));
        assert_eq!(ev.phase(), Phase::SimulatingAndRecording);

        let expected = ev.world().fallback_fitness(&ev.cfg.fitness);
        assert!(ev.expire_score_timer(now + Duration::from_millis(1000)));
        assert_eq!(ev.phase(), Phase::AdvancingIndividual);
        assert_eq!(ev.population().individuals()[0].fitness(), expected);

        // a late score for the timed-out episode is stale
        let episode = EpisodeId(1);
        assert!(!ev.receive_score(episode, 5.0));
        assert_eq!(ev.population().individuals()[0].fitness(), expected);
    }

    #[tokio::test]
    async fn completes_generation_and_carries_elite() {
        let (mut ev, mut rx) = evaluator(offline_config());
        let now = Instant::now();
        ev.start_evaluation(now).unwrap();

        let scores = [0.8, 0.6, 0.4, 0.2];
        for &score in &scores {
            assert_eq!(ev.generation(), 0);
            score_current(&mut ev, score);
            ev.advance(now).unwrap();
        }
        let best = ev.history()[0].best_genes;
        assert_eq!(ev.history()[0].best_fitness, 0.8);

        assert_eq!(ev.generation(), 1);
        assert_eq!(ev.phase(), Phase::SimulatingAndRecording);
        assert_eq!(ev.population().len(), 4);
        assert_eq!(*ev.population().individuals()[0].genes(), best);
        assert_eq!(ev.population().individuals()[0].fitness(), 0.0);

        let mut completed = false;
        while let Ok(notification) = rx.try_recv() {
            if let Notification::GenerationCompleted(stats) = notification {
                assert!((stats.avg_fitness - 0.5).abs() < 1e-12);
                completed = true;
            }
        }
        assert!(completed);
    }

    #[tokio::test]
    async fn halts_after_max_generations() {
        let (mut ev, _rx) = evaluator(offline_config());
        let now = Instant::now();
        ev.start_evaluation(now).unwrap();
        for _ in 0..8 {
            score_current(&mut ev, 0.5);
            ev.advance(now).unwrap();
        }
        assert!(ev.is_finished());
        assert_eq!(ev.phase(), Phase::Idle);
        assert_eq!(ev.history().len(), 2);
        assert_eq!(ev.start_evaluation(now).unwrap(), StartOutcome::Rejected);
    }

    #[tokio::test]
    async fn without_auto_run_idles_between_generations() {
        let mut cfg = offline_config();
        cfg.evolution.auto_run = false;
        let (mut ev, _rx) = evaluator(cfg);
        let now = Instant::now();
        ev.start_evaluation(now).unwrap();
        for _ in 0..4 {
            score_current(&mut ev, 0.5);
            ev.advance(now).unwrap();
        }
        assert_eq!(ev.phase(), Phase::Idle);
        assert_eq!(ev.generation(), 1);
        assert_eq!(ev.start_evaluation(now).unwrap(), StartOutcome::Started);
    }

    #[tokio::test]
    async fn stop_cancels_timer_and_resume_skips_scored() {
        let (mut ev, mut rx) = evaluator(offline_config());
        let now = Instant::now();
        ev.start_evaluation(now).unwrap();
        score_current(&mut ev, 0.9);
        ev.advance(now).unwrap();
        let abandoned = ev.active_episode().unwrap();

        ev.stop();
        assert_eq!(ev.phase(), Phase::Idle);
        assert_eq!(ev.score_deadline(), None);
        assert!(!ev.expire_score_timer(now + Duration::from_secs(60)));
        assert!(!ev.segment_completed(abandoned, 10));
        assert_eq!(ev.population().individuals()[0].fitness(), 0.9);

        ev.start_evaluation(now).unwrap();
        assert_eq!(ev.current_individual(), 1);
        assert_ne!(ev.active_episode(), Some(abandoned));

        let stopped = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|n| n == Notification::EvaluationStopped);
        assert!(stopped);
    }

    #[tokio::test]
    async fn disabling_auto_run_stops() {
        let (mut ev, _rx) = evaluator(offline_config());
        ev.start_evaluation(Instant::now()).unwrap();
        ev.set_auto_run(false);
        assert_eq!(ev.phase(), Phase::Idle);
        assert_eq!(ev.active_episode(), None);
    }
}
