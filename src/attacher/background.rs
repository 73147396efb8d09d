//! Deferred promotion and deletion.
//!
//! A deferred transition is captured in a [`BackgroundEnvelope`] and sent to
//! the job system as JSON. When a worker picks it up, the record is loaded
//! again and the slot's current attachment is compared by identity with the
//! captured one. If the slot changed in the meantime, promotion is discarded;
//! deletion always proceeds since the captured files are unreachable either
//! way.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use data_model::{Attachment, BackgroundEnvelope, Record, RecordKey};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::Attacher;
use crate::error::{AttacherError, AttacherResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    Promote,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", content = "envelope", rename_all = "snake_case")]
pub enum BackgroundJob {
    Promote(BackgroundEnvelope),
    Delete(BackgroundEnvelope),
}

impl BackgroundJob {
    pub fn kind(&self) -> JobKind {
        match self {
            BackgroundJob::Promote(_) => JobKind::Promote,
            BackgroundJob::Delete(_) => JobKind::Delete,
        }
    }

    pub fn envelope(&self) -> &BackgroundEnvelope {
        match self {
            BackgroundJob::Promote(envelope) | BackgroundJob::Delete(envelope) => envelope,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

/// The application's job queue.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, job: BackgroundJob) -> Result<()>;
}

/// In-process queue carrying serialized jobs to [`run_worker`].
pub struct ChannelSubmitter {
    sender: mpsc::UnboundedSender<String>,
}

impl ChannelSubmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl JobSubmitter for ChannelSubmitter {
    async fn submit(&self, job: BackgroundJob) -> Result<()> {
        let payload = job.to_json()?;
        self.sender
            .send(payload)
            .map_err(|_| anyhow::anyhow!("background worker has shut down"))
    }
}

/// Performs jobs until every sender is dropped. Failures are logged and the
/// worker moves on; retrying is left to the job system.
pub async fn run_worker(attacher: Arc<Attacher>, mut jobs: mpsc::UnboundedReceiver<String>) {
    while let Some(payload) = jobs.recv().await {
        let job = match BackgroundJob::from_json(&payload) {
            Ok(job) => job,
            Err(err) => {
                error!("dropping malformed background job: {:?}", err);
                continue;
            }
        };
        let kind = job.kind();
        match attacher.perform(job).await {
            Ok(outcome) => debug!(%kind, ?outcome, "background job finished"),
            Err(err) => error!(%kind, "background job failed: {:?}", err),
        }
    }
}

/// A decoded envelope.
#[derive(Debug, Clone)]
pub struct Loaded {
    /// The current record, or a placeholder if it no longer exists.
    pub record: Record,
    pub slot: String,
    pub attachment: Option<Attachment>,
    pub phase: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    Promoted(Attachment),
    Deleted,
    /// The slot no longer holds the captured attachment.
    Discarded,
}

pub fn dump(
    record: &RecordKey,
    slot: &str,
    attachment: Option<&Attachment>,
    phase: Option<&str>,
) -> AttacherResult<BackgroundEnvelope> {
    Ok(BackgroundEnvelope::new(attachment, record, slot, phase)?)
}

impl Attacher {
    pub async fn load(&self, envelope: &BackgroundEnvelope) -> AttacherResult<Loaded> {
        let attachment = envelope.attachment()?;
        let key = envelope.record_key();
        let record = match self.records.find(&key).await.map_err(AttacherError::Record)? {
            Some(record) => record,
            None => {
                debug!(record = %key, "record not found, using placeholder");
                Record::placeholder(key)
            }
        };

        Ok(Loaded {
            record,
            slot: envelope.name.clone(),
            attachment,
            phase: envelope.phase.clone(),
        })
    }

    pub async fn perform(&self, job: BackgroundJob) -> AttacherResult<ResumeOutcome> {
        match job {
            BackgroundJob::Promote(envelope) => self.resume_promote(&envelope).await,
            BackgroundJob::Delete(envelope) => self.resume_delete(&envelope).await,
        }
    }

    pub async fn resume_promote(&self, envelope: &BackgroundEnvelope) -> AttacherResult<ResumeOutcome> {
        let Loaded {
            mut record,
            slot,
            attachment,
            phase,
        } = self.load(envelope).await?;

        let Some(cached) = attachment else {
            return Ok(ResumeOutcome::Discarded);
        };
        if record.attachment(&slot) != Some(&cached) {
            info!(record = %record.key(), %slot, "attachment changed, discarding promotion");
            return Ok(ResumeOutcome::Discarded);
        }

        let stored = self
            .promote_in(&cached, Some(record.key()), Some(&slot), phase.as_deref())
            .await?;

        // The slot may have been reassigned while the upload ran.
        let latest = self
            .records
            .find(record.key())
            .await
            .map_err(AttacherError::Record)?;
        let current = latest.as_ref().and_then(|latest| latest.attachment(&slot));
        if current != Some(&cached) {
            info!(record = %record.key(), %slot, "attachment changed during promotion, discarding");
            if current != Some(&stored) {
                self.delete_now(&stored, Some(record.key()), Some(&slot), phase.as_deref())
                    .await?;
            }
            return Ok(ResumeOutcome::Discarded);
        }

        record.set_attachment(&slot, Some(stored.clone()));
        self.persist(&record, &slot).await?;
        Ok(ResumeOutcome::Promoted(stored))
    }

    pub async fn resume_delete(&self, envelope: &BackgroundEnvelope) -> AttacherResult<ResumeOutcome> {
        let Loaded {
            record,
            slot,
            attachment,
            phase,
        } = self.load(envelope).await?;

        let Some(attachment) = attachment else {
            return Ok(ResumeOutcome::Discarded);
        };
        self.delete_now(&attachment, Some(record.key()), Some(&slot), phase.as_deref())
            .await?;
        Ok(ResumeOutcome::Deleted)
    }
}
