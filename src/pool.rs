//! Fixed-size worker pool running one retry loop per object.
//!
//! Jobs go through a bounded crossbeam channel; each worker takes a request,
//! runs [`RetryingFetcher::fetch_counted`] to exhaustion and sends the tagged
//! result back. Results arrive in completion order.

use std::thread;

use crossbeam_channel::{bounded, unbounded};
use serde::Serialize;
use tracing::info;

use crate::app::{ProgressEvent, ProgressSink};
use crate::cutout::CutoutBuilder;
use crate::domain::{FetchRequest, ObjectId};
use crate::fetch::{CutoutResult, HttpTransport, RetryingFetcher, Sleeper};

pub const DEFAULT_WORKERS: usize = 5;

pub fn fetch_all<T, S>(
    fetcher: &RetryingFetcher<T, S>,
    builder: &CutoutBuilder,
    requests: Vec<FetchRequest>,
    workers: usize,
    sink: &dyn ProgressSink,
) -> Vec<CutoutResult>
where
    T: HttpTransport,
    S: Sleeper,
{
    let total = requests.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, total);
    let (job_tx, job_rx) = bounded::<(usize, FetchRequest)>(workers);
    let (result_tx, result_rx) = unbounded::<CutoutResult>();

    thread::scope(|scope| {
        for worker_id in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                info!(worker_id, "cutout worker started");
                while let Ok((index, request)) = job_rx.recv() {
                    let url = builder.url_for(&request);
                    let attempted = fetcher.fetch_counted(&url);
                    let result = CutoutResult {
                        id: request.id,
                        index,
                        url,
                        attempts: attempted.attempts,
                        outcome: attempted.outcome,
                    };
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
                info!(worker_id, "cutout worker shutting down");
            });
        }
        drop(job_rx);
        drop(result_tx);

        scope.spawn(move || {
            for job in requests.into_iter().enumerate() {
                if job_tx.send(job).is_err() {
                    break;
                }
            }
        });

        let mut results = Vec::with_capacity(total);
        for result in result_rx.iter() {
            let status = match &result.outcome {
                Ok(payload) => format!("ok bytes={}", payload.len()),
                Err(err) => format!("failed ({err})"),
            };
            sink.event(ProgressEvent {
                message: format!(
                    "phase=Fetch; {} {status} attempts={} done={}/{total}",
                    result.id,
                    result.attempts,
                    results.len() + 1
                ),
                elapsed: None,
            });
            results.push(result);
        }
        results
    })
}

/// Restores submission order so archive layout is reproducible.
pub fn sort_by_submission(results: &mut [CutoutResult]) {
    results.sort_by_key(|result| result.index);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retried: usize,
    pub failed_ids: Vec<ObjectId>,
}

impl BatchSummary {
    pub fn from_results(results: &[CutoutResult]) -> Self {
        let mut summary = BatchSummary {
            requested: results.len(),
            ..BatchSummary::default()
        };
        for result in results {
            if result.is_success() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
                summary.failed_ids.push(result.id.clone());
            }
            if result.attempts > 1 {
                summary.retried += 1;
            }
        }
        summary.failed_ids.sort();
        info!(
            requested = summary.requested,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "cutout batch finished"
        );
        summary
    }
}
