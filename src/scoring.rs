//! HTTP client for the remote scoring service.
//!
//! The service exposes `GET /health` and `POST /upload/video`; the latter takes
//! a multipart form (`episode_number`, `attempt_number`, `file_size`, `file`)
//! and answers with the episode's reward.

use crate::config::ServerConfig;
use crate::events::{EpisodeId, Event};
use anyhow::{Context, Result, bail};
use reqwest::{
    Client,
    multipart::{Form, Part},
};
use serde::Deserialize;
use std::time::Duration;
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};

/// Content type of uploaded segments; the service only accepts `video/*`.
const SEGMENT_MIME: &str = "video/x-boids-trajectory";

#[derive(Debug, Deserialize)]
struct UploadResponse {
    status: String,
    #[serde(default)]
    episode_number: Option<u64>,
    #[serde(default)]
    reward: f64,
}

#[derive(Debug, Clone)]
pub struct ScoringClient {
    client: Client,
    base_url: String,
    upload_attempts: u32,
    retry_delay: Duration,
}

impl ScoringClient {
    pub fn new(cfg: &ServerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.request_timeout())
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            upload_attempts: cfg.upload_attempts.max(1),
            retry_delay: cfg.upload_retry_delay(),
        })
    }

    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("health check returned {status}");
        }
        Ok(())
    }

    /// Upload one segment and return the reward from the response.
    pub async fn upload(&self, episode: EpisodeId, attempt: u32, payload: Vec<u8>) -> Result<f64> {
        let url = format!("{}/upload/video", self.base_url);
        let file_size = payload.len();
        let part = Part::bytes(payload)
            .file_name(format!("episode_{episode}.json"))
            .mime_str(SEGMENT_MIME)
            .context("invalid segment mime type")?;
        let form = Form::new()
            .text("episode_number", episode.to_string())
            .text("attempt_number", attempt.to_string())
            .text("file_size", file_size.to_string())
            .part("file", part);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("failed to upload to {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("upload returned {status}");
        }
        let body: UploadResponse = response
            .json()
            .await
            .context("failed to parse upload response")?;
        parse_reward(body, episode)
    }

    /// Upload with retries. Any failure after the last attempt yields a zero
    /// reward so the evaluation loop stays in step with the service.
    pub async fn score_segment(&self, episode: EpisodeId, payload: Vec<u8>) -> f64 {
        for attempt in 1..=self.upload_attempts {
            match self.upload(episode, attempt, payload.clone()).await {
                Ok(reward) => return reward,
                Err(error) => {
                    log::warn!(
                        "episode {episode}: upload attempt {attempt}/{} failed: {error:#}",
                        self.upload_attempts
                    );
                    if attempt < self.upload_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        log::error!("episode {episode}: no valid score from service; reporting zero reward");
        0.0
    }

    pub fn spawn_score_request(
        &self,
        episode: EpisodeId,
        payload: Vec<u8>,
        events: UnboundedSender<Event>,
    ) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let score = client.score_segment(episode, payload).await;
            // receiver gone means the loop has shut down
            let _ = events.send(Event::ScoreReceived { episode, score });
        })
    }

    /// Poll the health endpoint every `interval` until it succeeds, then send
    /// [`Event::ServerReady`].
    pub fn spawn_health_poll(
        &self,
        interval: Duration,
        events: UnboundedSender<Event>,
    ) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                match client.health().await {
                    Ok(()) => {
                        let _ = events.send(Event::ServerReady);
                        return;
                    }
                    Err(error) => {
                        log::warn!("scoring service unavailable: {error:#}");
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        })
    }
}

fn parse_reward(body: UploadResponse, episode: EpisodeId) -> Result<f64> {
    if body.status != "ok" {
        bail!("upload status is {:?}", body.status);
    }
    if let Some(number) = body.episode_number {
        if number != episode.0 {
            bail!("response is for episode {number}, expected {episode}");
        }
    }
    if !body.reward.is_finite() {
        bail!("reward is not finite");
    }
    Ok(body.reward)
}
