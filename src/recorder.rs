use crate::events::{EpisodeId, Event};
use crate::model::Agent;
use crate::scoring::ScoringClient;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// Sink for the frames of one episode.
pub trait Recorder {
    /// Start a new segment, discarding any unfinished one.
    fn start_recording(&mut self, episode: EpisodeId, generation: usize, individual: usize);

    /// Capture one frame of the flock. Ignored when no segment is active.
    fn capture(&mut self, agents: &[Agent]);

    /// Discard the active segment without reporting it.
    fn stop_recording(&mut self);
}

/// Planar agent state: `[x, z, yaw]`.
type AgentFrame = [f32; 3];

#[derive(Debug, Serialize)]
struct Segment {
    episode: u64,
    generation: usize,
    individual: usize,
    frames: Vec<Vec<AgentFrame>>,
}

/// Records top-down agent trajectories and hands finished segments to the
/// scoring service.
pub struct TrajectoryRecorder {
    frames_per_segment: usize,
    events: UnboundedSender<Event>,
    scoring: Option<ScoringClient>,
    active: Option<Segment>,
}

impl TrajectoryRecorder {
    pub fn new(
        frames_per_segment: usize,
        events: UnboundedSender<Event>,
        scoring: Option<ScoringClient>,
    ) -> Self {
        Self {
            frames_per_segment,
            events,
            scoring,
            active: None,
        }
    }

    #[cfg(test)]
    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    fn finish(&self, segment: Segment) {
        let episode = EpisodeId(segment.episode);
        let frames = segment.frames.len();
        let _ = self.events.send(Event::SegmentCompleted { episode, frames });

        let Some(scoring) = &self.scoring else {
            return;
        };
        match serde_json::to_vec(&segment) {
            Ok(payload) => {
                log::debug!("episode {episode}: uploading {} bytes", payload.len());
                scoring.spawn_score_request(episode, payload, self.events.clone());
            }
            Err(error) => {
                log::error!("episode {episode}: failed to encode segment: {error}");
                let _ = self.events.send(Event::ScoreReceived { episode, score: 0.0 });
            }
        }
    }
}

impl Recorder for TrajectoryRecorder {
    fn start_recording(&mut self, episode: EpisodeId, generation: usize, individual: usize) {
        if let Some(stale) = self.active.take() {
            log::debug!("discarding unfinished segment of episode {}", stale.episode);
        }
        self.active = Some(Segment {
            episode: episode.0,
            generation,
            individual,
            frames: Vec::with_capacity(self.frames_per_segment),
        });
    }

    fn capture(&mut self, agents: &[Agent]) {
        let Some(segment) = &mut self.active else {
            return;
        };
        segment.frames.push(
            agents
                .iter()
                .map(|agent| {
                    [
                        agent.position.x as f32,
                        agent.position.z as f32,
                        agent.heading.yaw() as f32,
                    ]
                })
                .collect(),
        );
        if segment.frames.len() >= self.frames_per_segment {
            if let Some(segment) = self.active.take() {
                self.finish(segment);
            }
        }
    }

    fn stop_recording(&mut self) {
        self.active = None;
    }
}
