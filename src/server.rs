use crate::limits::NUM_SLOTS;
use crate::worker::{self, Scorer, WorkMessage};
use crate::{SchedError, Scheduler};
use anyhow::{bail, Error};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub db_id: i64,
    pub multi_hits: bool,
    pub hmmer3_compat: bool,
    pub seqs: Vec<(String, String)>,
}

#[derive(Debug)]
pub enum WorkResponseMessage {
    JobSubmitted(i64),
    JobCompleted(i64),
    JobFailed(i64, String),
    SchedulerError(SchedError),
}

/// Runs `workers_count` workers, one output slot each, and turns client
/// submissions into jobs until `cancel_token` fires or a channel closes.
pub async fn serve(
    cancel_token: CancellationToken,
    sched: Scheduler,
    workers_count: u16,
    scorer: Arc<dyn Scorer>,
    poll_interval: Duration,
    mut recv_from_client: mpsc::UnboundedReceiver<SubmitRequest>,
    send_to_client: mpsc::UnboundedSender<WorkResponseMessage>,
) -> Result<(), Error> {
    if workers_count as usize > NUM_SLOTS {
        bail!("at most {} workers are supported, got {}", NUM_SLOTS, workers_count);
    }

    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();

    let mut workers = vec![];
    for slot in 0..workers_count as usize {
        let slot = match sched.writer().acquire(slot).await {
            Ok(slot) => slot,
            Err(err) => {
                cancel_token.cancel();
                return Err(err.into());
            }
        };
        let sched = sched.clone();
        let scorer = scorer.clone();
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, sched, slot, scorer, poll_interval, send_to_server).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }
    drop(send_to_server);

    loop {
        tokio::select! {
            // Handle cancellation
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            // Handle responses from workers
            chan_msg = recv_from_worker.recv() => {
                let response = match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(WorkMessage::JobStarted(job_id)) => {
                        debug!(message = "Started job", job_id);
                        continue;
                    },
                    Some(WorkMessage::JobCompleted(job_id)) => {
                        debug!(message = "Completed job", job_id);
                        WorkResponseMessage::JobCompleted(job_id)
                    },
                    Some(WorkMessage::JobFailed(job_id, error_msg)) => {
                        debug!(message = "Failed job", job_id, error = ?error_msg);
                        WorkResponseMessage::JobFailed(job_id, error_msg)
                    },
                };
                if let Err(err) = send_to_client.send(response) {
                    error!(message = "Failed to send response to client", error = ?err);
                    cancel_token.cancel();
                    break;
                }
            },
            // Handle requests from clients
            chan_msg = recv_from_client.recv() => {
                let Some(request) = chan_msg else {
                    debug!("Client channel closed unexpectedly, exiting");
                    cancel_token.cancel();
                    break;
                };
                debug!(message = "Requested job", db_id = request.db_id, nseqs = request.seqs.len());
                let response = match sched
                    .submit_job(request.db_id, request.multi_hits, request.hmmer3_compat, request.seqs)
                    .await
                {
                    Ok(job) => WorkResponseMessage::JobSubmitted(job.id),
                    Err(err) => WorkResponseMessage::SchedulerError(err),
                };
                if let Err(err) = send_to_client.send(response) {
                    error!(message = "Failed to send response to client", error = ?err);
                    cancel_token.cancel();
                    break;
                }
            }
        }
    }

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}
