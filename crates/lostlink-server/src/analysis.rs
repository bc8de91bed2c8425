//! Match analysis: embed a lost or found report, score it against the
//! candidates from the other side, keep the best few, persist them and
//! publish them on the report's topic.
//!
//! Jobs run on a fixed pool of workers fed by a bounded queue. Submitting
//! returns a [`JobTicket`] that resolves once the job has been published
//! or has failed.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use lostlink_shared::constants::NO_EMBEDDING_SCORE;
use lostlink_shared::{MatchScore, TopicKey, TopicKind};
use serde::Deserialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::error::ServerError;
use crate::topics::TopicPublisher;

pub type MatchPublisher = TopicPublisher<Vec<MatchScore>>;

/// Source of description embeddings. `None` means no usable vector.
pub trait Embedder: Send + Sync {
    fn embed<'a>(&'a self, description: &'a str) -> BoxFuture<'a, Option<Vec<f64>>>;
}

/// Calls an HTTP embedding service: the description goes out as the
/// multipart field `description`, the vector comes back as
/// `embedding_vector`.
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding_vector: Option<Vec<f64>>,
}

impl HttpEmbedder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    async fn request(&self, description: &str) -> Result<Option<Vec<f64>>, reqwest::Error> {
        let form = reqwest::multipart::Form::new().text("description", description.to_string());
        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        let body: EmbeddingResponse = response.json().await?;
        Ok(body.embedding_vector)
    }
}

impl Embedder for HttpEmbedder {
    fn embed<'a>(&'a self, description: &'a str) -> BoxFuture<'a, Option<Vec<f64>>> {
        async move {
            match self.request(description).await {
                Ok(vector) => vector,
                Err(e) => {
                    warn!(url = %self.url, error = %e, "embedding request failed");
                    None
                }
            }
        }
        .boxed()
    }
}

/// Cosine similarity over the common prefix of `a` and `b`.
///
/// Returns [`NO_EMBEDDING_SCORE`] when either side is missing or has zero
/// norm.
pub fn cosine(a: Option<&[f64]>, b: Option<&[f64]>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return NO_EMBEDDING_SCORE;
    };

    let (mut dot, mut norm_a, mut norm_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return NO_EMBEDDING_SCORE;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Drop negative scores, sort best first and keep at most `limit`.
pub fn rank(mut scores: Vec<MatchScore>, limit: usize) -> Vec<MatchScore> {
    scores.retain(|s| s.score >= 0.0);
    scores.sort_by(|a, b| b.score.total_cmp(&a.score));
    scores.truncate(limit);
    scores
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: i64,
    pub description: String,
}

/// Score one report (`subject`) against candidate reports of the other kind.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub subject: TopicKey,
    pub description: String,
    pub candidates: Vec<Candidate>,
}

impl AnalysisJob {
    fn pair(&self, candidate: i64, score: f64) -> MatchScore {
        let (found_item_id, lost_item_id) = match self.subject.kind {
            TopicKind::Found => (self.subject.id, candidate),
            TopicKind::Lost => (candidate, self.subject.id),
        };
        MatchScore {
            found_item_id,
            lost_item_id,
            score,
        }
    }
}

type JobResult = Result<Vec<MatchScore>, ServerError>;

/// Completion handle for a submitted job.
pub struct JobTicket {
    rx: oneshot::Receiver<JobResult>,
}

impl JobTicket {
    /// Wait for the published scores.
    pub async fn wait(self) -> JobResult {
        self.rx
            .await
            .map_err(|_| ServerError::Internal("analysis worker dropped the job".into()))?
    }
}

struct Queued {
    job: AnalysisJob,
    done: oneshot::Sender<JobResult>,
}

#[derive(Clone)]
struct Worker {
    embedder: Arc<dyn Embedder>,
    db: Db,
    publisher: MatchPublisher,
    limit: usize,
}

#[derive(Clone)]
pub struct AnalysisPool {
    tx: mpsc::Sender<Queued>,
    capacity: usize,
}

impl AnalysisPool {
    /// Spawn `workers` tasks sharing a queue of `capacity` pending jobs.
    pub fn start(
        workers: usize,
        capacity: usize,
        limit: usize,
        embedder: Arc<dyn Embedder>,
        db: Db,
        publisher: MatchPublisher,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Queued>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let worker = Worker {
            embedder,
            db,
            publisher,
            limit,
        };

        for n in 0..workers {
            let rx = rx.clone();
            let worker = worker.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(Queued { job, done }) = next else {
                        break;
                    };
                    let subject = job.subject;
                    let result = worker.run(job).await;
                    if let Err(e) = &result {
                        warn!(worker = n, topic = %subject, error = %e, "analysis failed");
                    }
                    // The submitter may have stopped waiting.
                    let _ = done.send(result);
                }
                debug!(worker = n, "analysis worker stopped");
            });
        }

        info!(workers, capacity, "analysis pool started");
        Self { tx, capacity }
    }

    /// Enqueue `job` without waiting for room.
    pub fn submit(&self, job: AnalysisJob) -> Result<JobTicket, ServerError> {
        let (done, rx) = oneshot::channel();
        match self.tx.try_send(Queued { job, done }) {
            Ok(()) => Ok(JobTicket { rx }),
            Err(TrySendError::Full(_)) => Err(ServerError::QueueFull),
            Err(TrySendError::Closed(_)) => {
                Err(ServerError::Internal("analysis pool is shut down".into()))
            }
        }
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }
}

impl Worker {
    async fn run(&self, job: AnalysisJob) -> JobResult {
        let subject = self
            .embedder
            .embed(&job.description)
            .await
            .ok_or(ServerError::NoEmbedding)?;

        let mut scores = Vec::with_capacity(job.candidates.len());
        for candidate in &job.candidates {
            let vector = self.embedder.embed(&candidate.description).await;
            let score = cosine(Some(subject.as_slice()), vector.as_deref());
            scores.push(job.pair(candidate.id, score));
        }

        let ranked = rank(scores, self.limit);
        let to_save = ranked.clone();
        self.db
            .call(move |db| db.save_match_suggestions(&to_save))
            .await?;

        let report = self.publisher.publish(&job.subject, ranked.clone()).await;
        info!(
            topic = %job.subject,
            candidates = job.candidates.len(),
            kept = ranked.len(),
            viewers = report.accepted,
            "match analysis published"
        );
        Ok(ranked)
    }
}
