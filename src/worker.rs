use crate::writer::SlotWriter;
use crate::{Job, JobOutcome, NewProduct, Scheduler, Sequence};
use crate::SchedResult;
use anyhow::Error;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, Mutex};
use tokio::{task, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug)]
pub enum WorkMessage {
    JobStarted(i64),
    JobCompleted(i64),
    JobFailed(i64, String),
}

/// One scoring hit of a sequence against a profile. `matches` are the match
/// fragments, written to the report separated by `;`.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub profile_name: String,
    pub abc_name: String,
    pub alt_loglik: f64,
    pub null_loglik: f64,
    pub profile_typeid: String,
    pub version: String,
    pub matches: Vec<String>,
}

impl Hit {
    fn to_product(&self, job_id: i64, seq_id: i64) -> NewProduct {
        NewProduct {
            job_id,
            seq_id,
            profile_name: self.profile_name.clone(),
            abc_name: self.abc_name.clone(),
            alt_loglik: self.alt_loglik,
            null_loglik: self.null_loglik,
            profile_typeid: self.profile_typeid.clone(),
            version: self.version.clone(),
            match_data: self.matches.join(";"),
        }
    }
}

/// The profile-scoring algorithm. Lives outside this crate and is called on
/// the blocking thread pool.
pub trait Scorer: Send + Sync {
    fn score(&self, job: &Job, seq: &Sequence) -> Result<Vec<Hit>, Error>;
}

/// Polls the scheduler for pending jobs until cancelled, scoring each one,
/// recording its products and streaming them into `slot`.
pub async fn start(
    cancel_token: CancellationToken,
    sched: Scheduler,
    slot: SlotWriter,
    scorer: Arc<dyn Scorer>,
    poll_interval: Duration,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    let slot = Arc::new(Mutex::new(slot));
    let notify = |msg: WorkMessage| {
        if send_to_server.send(msg).is_err() {
            debug!("Server is gone, dropping work message");
        }
    };

    loop {
        if cancel_token.is_cancelled() {
            debug!("Worker Cancelled");
            break;
        }

        let job = match sched.next_job_for_worker().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Worker Cancelled");
                        break;
                    },
                    _ = sleep(poll_interval) => continue,
                }
            }
            Err(err) => {
                error!(message = "Error claiming job", error = %err);
                sleep(poll_interval).await;
                continue;
            }
        };

        let job_id = job.id;
        notify(WorkMessage::JobStarted(job_id));
        match process(&sched, &slot, &scorer, &job).await {
            Ok(()) => match sched.finish_job(job_id, JobOutcome::Success).await {
                Ok(()) => notify(WorkMessage::JobCompleted(job_id)),
                Err(err) => error!(message = "Failed to mark job done", job_id, error = %err),
            },
            Err(err) => {
                let aborting = slot.clone();
                match task::spawn_blocking(move || aborting.blocking_lock().abort()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(message = "Failed to drop partial record", error = %err),
                    Err(err) => warn!(message = "Failed to drop partial record", error = %err),
                }
                let msg = err.to_string();
                match sched.finish_job(job_id, JobOutcome::Failure(msg.clone())).await {
                    Ok(()) => notify(WorkMessage::JobFailed(job_id, msg)),
                    Err(err) => error!(message = "Failed to mark job failed", job_id, error = %err),
                }
            }
        }
    }
    info!("Worker stopped.");
}

#[instrument(skip_all, fields(job_id = %job.id))]
async fn process(
    sched: &Scheduler,
    slot: &Arc<Mutex<SlotWriter>>,
    scorer: &Arc<dyn Scorer>,
    job: &Job,
) -> Result<(), Error> {
    let mut cursor = None;
    while let Some(seq) = sched.seqs().next_after(job.id, cursor).await? {
        cursor = Some(seq.id);
        let seq_id = seq.id;
        let hits = {
            let scorer = scorer.clone();
            let job = job.clone();
            task::spawn_blocking(move || scorer.score(&job, &seq)).await??
        };
        debug!(seq_id, nhits = hits.len(), "Sequence scored");

        for hit in hits {
            let prod = hit.to_product(job.id, seq_id);
            sched.record_product(&prod).await?;

            let slot = slot.clone();
            task::spawn_blocking(move || stream_hit(&mut slot.blocking_lock(), &prod, &hit.matches)).await??;
        }
    }
    Ok(())
}

fn stream_hit(slot: &mut SlotWriter, prod: &NewProduct, matches: &[String]) -> SchedResult<()> {
    slot.write_begin(prod)?;
    for (i, fragment) in matches.iter().enumerate() {
        if i > 0 {
            slot.write_match_sep()?;
        }
        slot.write_match(write_fragment, fragment.as_str())?;
    }
    slot.write_end()
}

fn write_fragment(out: &mut dyn Write, fragment: &str) -> std::io::Result<()> {
    out.write_all(fragment.as_bytes())
}
