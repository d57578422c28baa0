//! One processor per (recording type, state list): polls the queue, owns a
//! bounded pool of worker tasks, and reaps completions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{Instrument as _, debug, error, info, info_span};

use faunaproc_core::api::{ApiClient, ApiError};
use faunaproc_core::config::Config;
use faunaproc_core::types::{ProcessingState, RecordingType};
use faunaproc_pipelines::Pipeline;

pub(crate) struct Processor {
    pub(crate) recording_type: RecordingType,
    pub(crate) states: Vec<ProcessingState>,
    pipeline: Pipeline,
    num_workers: usize,
    no_job_sleep: Duration,
    /// Recording id -> running job. Invariant: never more entries than
    /// `num_workers`, and one entry per recording id.
    in_progress: HashMap<u64, JobHandle>,
    pub(crate) last_poll: Option<Instant>,
    last_poll_success: bool,
    pub(crate) last_success: Option<Instant>,
}

struct JobHandle {
    job_key: String,
    task: JoinHandle<anyhow::Result<()>>,
}

struct FailedJob {
    recording_id: u64,
    job_key: String,
    error: String,
}

impl Processor {
    pub(crate) fn new(
        recording_type: RecordingType,
        states: Vec<ProcessingState>,
        pipeline: Pipeline,
        num_workers: usize,
        no_job_sleep: Duration,
    ) -> Self {
        Self {
            recording_type,
            states,
            pipeline,
            num_workers,
            no_job_sleep,
            in_progress: HashMap::new(),
            last_poll: None,
            last_poll_success: false,
            last_success: None,
        }
    }

    pub(crate) fn full(&self) -> bool {
        self.in_progress.len() >= self.num_workers
    }

    pub(crate) fn has_work(&self) -> bool {
        !self.in_progress.is_empty()
    }

    /// Poll when there is worker capacity, unless the last poll came back
    /// empty and the back-off window has not elapsed yet.
    pub(crate) fn should_poll(&self) -> bool {
        !self.full()
            && (self.last_poll_success
                || match self.last_poll {
                    None => true,
                    Some(at) => at.elapsed() > self.no_job_sleep,
                })
    }

    /// Skip the empty-poll back-off on the next poll.
    pub(crate) fn force_poll(&mut self) {
        self.last_poll_success = true;
    }

    pub(crate) fn states_label(&self) -> String {
        self.states
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Reap completions, then ask the queue for work for each configured
    /// state and schedule it on the worker pool.
    pub(crate) async fn poll(
        &mut self,
        api: &mut ApiClient,
        config: &Arc<Config>,
    ) -> Result<(), ApiError> {
        self.reap_and_report(api).await;
        if !self.should_poll() {
            return Ok(());
        }

        self.last_poll_success = false;
        let states = self.states.clone();
        for state in states {
            if self.full() {
                break;
            }
            let response = api.next_job(self.recording_type, state).await?;
            self.last_poll = Some(Instant::now());
            let Some(job) = response else { continue };
            self.last_poll_success = true;

            let recording_id = job.recording.id;
            if let Some(existing) = self.in_progress.get(&recording_id) {
                info!(
                    recording = recording_id,
                    %state,
                    "recording is already scheduled, cancelling the running job"
                );
                if existing.task.is_finished() {
                    // Too late to cancel; the completed job is reaped on the
                    // next pass and the duplicate assignment is skipped.
                    info!(recording = recording_id, "cancel failed, skipping");
                    continue;
                }
                existing.task.abort();
                self.in_progress.remove(&recording_id);
            }

            debug!(
                recording = recording_id,
                kind = %self.recording_type,
                %state,
                "scheduling"
            );
            let job_key = job.job_key.clone();
            let task = tokio::spawn(
                faunaproc_pipelines::run(self.pipeline, job, config.clone()).instrument(
                    info_span!("job", pipeline = %self.pipeline, recording = recording_id),
                ),
            );
            self.in_progress
                .insert(recording_id, JobHandle { job_key, task });
        }
        Ok(())
    }

    /// Reap terminal jobs and report the failures, swallowing (but logging)
    /// reporting errors; the service's job-key timeout is the backstop.
    pub(crate) async fn reap_and_report(&mut self, api: &mut ApiClient) {
        for failed in self.reap_completed().await {
            error!(
                "{}.[{}] processing of {} failed: {}",
                self.recording_type,
                self.states_label(),
                failed.recording_id,
                failed.error
            );
            if let Err(err) = api.report_failed(failed.recording_id, &failed.job_key).await {
                error!(
                    recording = failed.recording_id,
                    "could not mark recording as failed: {err}"
                );
            }
        }
    }

    /// Remove every terminal entry from the in-flight map, returning the
    /// jobs that failed. Cancelled jobs report neither success nor failure.
    async fn reap_completed(&mut self) -> Vec<FailedJob> {
        let finished: Vec<u64> = self
            .in_progress
            .iter()
            .filter(|(_, handle)| handle.task.is_finished())
            .map(|(&id, _)| id)
            .collect();

        let mut failures = Vec::new();
        for recording_id in finished {
            let Some(handle) = self.in_progress.remove(&recording_id) else {
                continue;
            };
            match handle.task.await {
                Ok(Ok(())) => {
                    self.last_success = Some(Instant::now());
                }
                Ok(Err(err)) => failures.push(FailedJob {
                    recording_id,
                    job_key: handle.job_key,
                    error: format!("{err:#}"),
                }),
                Err(err) if err.is_cancelled() => {
                    info!(recording = recording_id, "job was cancelled");
                }
                Err(err) => failures.push(FailedJob {
                    recording_id,
                    job_key: handle.job_key,
                    error: format!("worker panicked: {err}"),
                }),
            }
        }
        failures
    }

    /// Abort all in-flight jobs without reporting them; the service
    /// requeues them after its job-key timeout.
    pub(crate) fn abort_all(&mut self) {
        for (_, handle) in self.in_progress.drain() {
            handle.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_processor(num_workers: usize, no_job_sleep: Duration) -> Processor {
        Processor::new(
            RecordingType::ThermalRaw,
            vec![ProcessingState::Analyse, ProcessingState::Reprocess],
            Pipeline::ThermalClassify,
            num_workers,
            no_job_sleep,
        )
    }

    fn insert_job(processor: &mut Processor, recording_id: u64, task: JoinHandle<anyhow::Result<()>>) {
        processor.in_progress.insert(
            recording_id,
            JobHandle {
                job_key: format!("key-{recording_id}"),
                task,
            },
        );
    }

    async fn wait_for_terminal(processor: &Processor, recording_id: u64) {
        for _ in 0..500 {
            let terminal = processor
                .in_progress
                .get(&recording_id)
                .map_or(true, |handle| handle.task.is_finished());
            if terminal {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("job {recording_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn fresh_processor_polls() {
        let processor = test_processor(2, Duration::from_secs(30));
        assert!(processor.should_poll());
        assert!(!processor.full());
        assert!(!processor.has_work());
    }

    #[tokio::test]
    async fn empty_poll_backs_off_until_forced() {
        let mut processor = test_processor(2, Duration::from_secs(300));
        processor.last_poll = Some(Instant::now());
        processor.last_poll_success = false;
        assert!(!processor.should_poll());

        processor.force_poll();
        assert!(processor.should_poll());
    }

    #[tokio::test]
    async fn elapsed_backoff_allows_polling_again() {
        let mut processor = test_processor(1, Duration::from_millis(0));
        processor.last_poll = Some(Instant::now() - Duration::from_millis(10));
        processor.last_poll_success = false;
        assert!(processor.should_poll());
    }

    #[tokio::test]
    async fn full_pool_never_polls() {
        let mut processor = test_processor(1, Duration::from_secs(0));
        insert_job(&mut processor, 1, tokio::spawn(std::future::pending()));
        processor.force_poll();
        assert!(processor.full());
        assert!(!processor.should_poll());
        processor.abort_all();
    }

    #[tokio::test]
    async fn reap_records_success_and_clears_the_entry() {
        let mut processor = test_processor(2, Duration::from_secs(0));
        let task = tokio::spawn(async { Ok(()) });
        insert_job(&mut processor, 7, task);
        wait_for_terminal(&processor, 7).await;

        let failures = processor.reap_completed().await;
        assert!(failures.is_empty());
        assert!(!processor.has_work());
        assert!(processor.last_success.is_some());
    }

    #[tokio::test]
    async fn reap_surfaces_failures_with_their_job_key() {
        let mut processor = test_processor(2, Duration::from_secs(0));
        let task = tokio::spawn(async { anyhow::bail!("classifier exploded") });
        insert_job(&mut processor, 9, task);
        wait_for_terminal(&processor, 9).await;

        let failures = processor.reap_completed().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].recording_id, 9);
        assert_eq!(failures[0].job_key, "key-9");
        assert!(failures[0].error.contains("classifier exploded"));
        assert!(processor.last_success.is_none());
        assert!(!processor.has_work());
    }

    #[tokio::test]
    async fn cancelled_jobs_are_reaped_silently() {
        let mut processor = test_processor(2, Duration::from_secs(0));
        let task: JoinHandle<anyhow::Result<()>> = tokio::spawn(std::future::pending());
        task.abort();
        insert_job(&mut processor, 3, task);
        wait_for_terminal(&processor, 3).await;

        let failures = processor.reap_completed().await;
        assert!(failures.is_empty());
        assert!(!processor.has_work());
        assert!(processor.last_success.is_none());
    }

    #[tokio::test]
    async fn unfinished_jobs_stay_in_flight() {
        let mut processor = test_processor(2, Duration::from_secs(0));
        insert_job(&mut processor, 5, tokio::spawn(std::future::pending()));

        let failures = processor.reap_completed().await;
        assert!(failures.is_empty());
        assert!(processor.has_work());
        processor.abort_all();
        assert!(!processor.has_work());
    }
}
