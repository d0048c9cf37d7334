mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use zoo_cutouts::cutout::CutoutBuilder;
use zoo_cutouts::domain::{FetchRequest, ObjectId};
use zoo_cutouts::error::FetchError;
use zoo_cutouts::fetch::{HttpTransport, RetryPolicy, RetryingFetcher};
use zoo_cutouts::output::JsonOutput;
use zoo_cutouts::pool::{BatchSummary, fetch_all, sort_by_submission};

use common::{JPEG, Recorder};

/// Fails every request for the object at ra=13; tracks peak concurrency.
#[derive(Default)]
struct Sky {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl HttpTransport for Sky {
    fn get(&self, url: &str, _timeout: Duration) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(5));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if url.contains("&ra=13&") {
            Err(FetchError::Connection("reset by peer".to_string()))
        } else {
            Ok(JPEG.to_vec())
        }
    }
}

fn requests(n: usize) -> Vec<FetchRequest> {
    (0..n)
        .map(|i| FetchRequest {
            id: format!("{}", 1000 + i).parse::<ObjectId>().unwrap(),
            ra: (10 + i) as f64,
            dec: -1.5,
            angular_size: 6.0,
        })
        .collect()
}

fn instant_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        delay: Duration::ZERO,
        timeout: Duration::from_secs(1),
    }
}

#[test]
fn one_failure_does_not_affect_other_objects() {
    let fetcher =
        RetryingFetcher::with_sleeper(Sky::default(), Recorder::default(), instant_policy());
    let builder = CutoutBuilder::hips2fits("CDS/P/SDSS9/color");

    let mut results = fetch_all(&fetcher, &builder, requests(8), 3, &JsonOutput);
    assert_eq!(results.len(), 8);
    sort_by_submission(&mut results);

    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.index, i);
        if result.id.as_str() == "1003" {
            assert_eq!(result.attempts, 3);
            assert!(result.outcome.as_ref().unwrap_err().is_exhausted());
        } else {
            assert_eq!(result.attempts, 1);
            assert_eq!(result.outcome.as_ref().unwrap(), &JPEG.to_vec());
        }
    }
    // 7 successes plus 3 attempts for the failing object
    assert_eq!(fetcher.transport().calls.load(Ordering::SeqCst), 10);
    assert_eq!(fetcher.sleeper().sleeps().len(), 2);

    let summary = BatchSummary::from_results(&results);
    assert_eq!(summary.requested, 8);
    assert_eq!(summary.succeeded, 7);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.retried, 1);
    assert_eq!(summary.failed_ids, vec!["1003".parse::<ObjectId>().unwrap()]);
}

#[test]
fn concurrency_never_exceeds_worker_count() {
    let fetcher =
        RetryingFetcher::with_sleeper(Sky::default(), Recorder::default(), instant_policy());
    let builder = CutoutBuilder::hips2fits("CDS/P/SDSS9/color");

    let results = fetch_all(&fetcher, &builder, requests(20), 4, &JsonOutput);
    assert_eq!(results.len(), 20);
    let peak = fetcher.transport().peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 4, "peak concurrency {peak}");
}

#[test]
fn more_workers_than_jobs_is_fine() {
    let fetcher =
        RetryingFetcher::with_sleeper(Sky::default(), Recorder::default(), instant_policy());
    let builder = CutoutBuilder::hips2fits("CDS/P/SDSS9/color");

    let results = fetch_all(&fetcher, &builder, requests(2), 16, &JsonOutput);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|result| result.is_success()));
}

#[test]
fn empty_batch_returns_nothing() {
    let fetcher =
        RetryingFetcher::with_sleeper(Sky::default(), Recorder::default(), instant_policy());
    let builder = CutoutBuilder::hips2fits("CDS/P/SDSS9/color");

    assert!(fetch_all(&fetcher, &builder, Vec::new(), 4, &JsonOutput).is_empty());
    assert_eq!(fetcher.transport().calls.load(Ordering::SeqCst), 0);
}
