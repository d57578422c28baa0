//! The outer poll loop: owns the processors, the adaptive sleep, the
//! tracking -> analyse prerequisite edge, and the periodic self-restart.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use tokio::sync::mpsc;
use tracing::{error, info};

use faunaproc_core::api::ApiClient;
use faunaproc_core::config::Config;
use faunaproc_core::types::{ProcessingState, RecordingType};
use faunaproc_pipelines::Pipeline;

use crate::processor::Processor;

const SLEEP_SECS: Duration = Duration::from_secs(2);

/// Register one processor per configured pipeline, in poll order, along
/// with the (dependent, prerequisite) edges. Pipelines with zero workers
/// are skipped.
fn build_processors(config: &Config) -> (Vec<Processor>, Vec<(usize, usize)>) {
    let no_job_sleep = config.no_job_sleep();
    let mut processors: Vec<Processor> = Vec::new();
    let mut prerequisites = Vec::new();

    let add = |processors: &mut Vec<Processor>,
               kind: RecordingType,
               states: Vec<ProcessingState>,
               pipeline: Pipeline,
               workers: usize| {
        processors.push(Processor::new(kind, states, pipeline, workers, no_job_sleep));
        processors.len() - 1
    };

    if config.audio.analysis_workers > 0 {
        add(
            &mut processors,
            RecordingType::Audio,
            vec![ProcessingState::Finished],
            Pipeline::AudioTrackAnalysis,
            config.audio.analysis_workers,
        );
        add(
            &mut processors,
            RecordingType::Audio,
            vec![ProcessingState::Analyse, ProcessingState::Reprocess],
            Pipeline::AudioAnalysis,
            config.audio.analysis_workers,
        );
    }

    if config.ir.tracking_workers > 0 {
        add(
            &mut processors,
            RecordingType::IrRaw,
            vec![ProcessingState::Tracking, ProcessingState::Retrack],
            Pipeline::ThermalTracking,
            config.ir.tracking_workers,
        );
    }
    if config.ir.analyse_workers > 0 {
        add(
            &mut processors,
            RecordingType::IrRaw,
            vec![ProcessingState::Analyse, ProcessingState::Reprocess],
            Pipeline::ThermalClassify,
            config.ir.analyse_workers,
        );
    }

    let mut tracking_states = vec![ProcessingState::Tracking];
    if config.thermal.do_retrack {
        tracking_states.push(ProcessingState::Retrack);
    }
    let thermal_tracking = (config.thermal.tracking_workers > 0).then(|| {
        add(
            &mut processors,
            RecordingType::ThermalRaw,
            tracking_states,
            Pipeline::ThermalTracking,
            config.thermal.tracking_workers,
        )
    });
    if config.thermal.analyse_workers > 0 {
        let analyse = add(
            &mut processors,
            RecordingType::ThermalRaw,
            vec![ProcessingState::Analyse, ProcessingState::Reprocess],
            Pipeline::ThermalClassify,
            config.thermal.analyse_workers,
        );
        // Freshly tracked recordings go straight to analysis, so a tracking
        // success should trigger an analyse poll.
        if let Some(tracking) = thermal_tracking {
            prerequisites.push((analyse, tracking));
        }
    }

    if let Some(trail) = &config.trailcam {
        if trail.trail_workers > 0 {
            add(
                &mut processors,
                RecordingType::TrailcamImage,
                vec![ProcessingState::Analyse],
                Pipeline::TrailcamImage,
                trail.trail_workers,
            );
        }
    }

    (processors, prerequisites)
}

/// Shutdown requests delivered to [`Dispatcher::run`].
#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    /// Stop polling and let in-flight jobs finish.
    Graceful,
    /// Abort in-flight jobs and return immediately.
    Immediate,
}

/// Owns the ordered set of processors and drives the poll loop.
pub struct Dispatcher {
    processors: Vec<Processor>,
    /// (dependent, prerequisite) processor indices: the dependent is forced
    /// to poll when the prerequisite succeeded after the dependent's last
    /// poll.
    prerequisites: Vec<(usize, usize)>,
    api: ApiClient,
    config: Arc<Config>,
    started_at: Instant,
}

impl Dispatcher {
    /// Authenticate with the recording service and register one processor
    /// per configured pipeline. Pipelines with zero workers are skipped.
    pub async fn connect(config: Arc<Config>) -> anyhow::Result<Self> {
        let api = ApiClient::connect(&config.api_url, &config.api_user, &config.api_password)
            .await
            .context("authenticating with the recording service")?;

        let (processors, prerequisites) = build_processors(&config);
        anyhow::ensure!(
            !processors.is_empty(),
            "no pipelines configured with workers"
        );

        Ok(Self {
            processors,
            prerequisites,
            api,
            config,
            started_at: Instant::now(),
        })
    }

    fn force_dependent_polls(&mut self) {
        for &(dependent, prerequisite) in &self.prerequisites {
            let forced = match (
                self.processors[dependent].last_poll,
                self.processors[prerequisite].last_success,
            ) {
                (Some(last_poll), Some(last_success)) => last_success > last_poll,
                _ => false,
            };
            if forced {
                info!(
                    kind = %self.processors[dependent].recording_type,
                    states = %self.processors[dependent].states_label(),
                    "forcing poll as a prerequisite job finished"
                );
                self.processors[dependent].force_poll();
            }
        }
    }

    /// Drive the poll loop until a shutdown signal arrives or the
    /// configured restart deadline passes with every processor idle.
    pub async fn run(
        mut self,
        mut shutdown: mpsc::UnboundedReceiver<ShutdownSignal>,
    ) -> anyhow::Result<()> {
        info!("checking for recordings");
        let mut draining = false;

        loop {
            if draining {
                for processor in &mut self.processors {
                    processor.reap_and_report(&mut self.api).await;
                }
                if !self.processors.iter().any(Processor::has_work) {
                    info!("in-flight work drained, exiting");
                    return Ok(());
                }
            } else {
                self.force_dependent_polls();
                for processor in &mut self.processors {
                    if let Err(err) = processor.poll(&mut self.api, &self.config).await {
                        if err.is_network() {
                            error!("network error while polling, will retry: {err}");
                        } else {
                            error!("error while polling: {err}");
                        }
                    }
                }
            }

            let sleep_for = if draining || self.processors.iter().any(Processor::has_work) {
                SLEEP_SECS
            } else {
                if let Some(restart_after) = self.config.restart_after() {
                    let uptime = self.started_at.elapsed();
                    if uptime > restart_after {
                        info!(
                            "restarting after {:.1} hours of uptime",
                            uptime.as_secs_f64() / 3600.0
                        );
                        return Ok(());
                    }
                }
                if self.processors.iter().all(|p| !p.should_poll()) {
                    info!("nothing to process - extending wait time");
                    self.config.no_recordings_wait()
                } else {
                    SLEEP_SECS
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                signal = shutdown.recv() => match signal {
                    Some(ShutdownSignal::Graceful) => {
                        if !draining {
                            info!("stop requested - finishing in-flight work before exiting");
                            draining = true;
                        }
                    }
                    Some(ShutdownSignal::Immediate) | None => {
                        info!("stop requested again - aborting in-flight work");
                        for processor in &mut self.processors {
                            processor.abort_all();
                        }
                        return Ok(());
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use faunaproc_core::config::{
        AudioConfig, IrConfig, TaggingConfig, ThermalConfig, TrailcamConfig,
    };

    fn test_config() -> Config {
        Config {
            api_url: "http://127.0.0.1:2008".to_string(),
            api_user: "worker@example.com".to_string(),
            api_password: "hunter2".to_string(),
            temp_dir: PathBuf::from("/tmp"),
            no_recordings_wait_secs: 30,
            no_job_sleep_seconds: 30,
            subprocess_timeout: 1200,
            restart_after: None,
            thermal: ThermalConfig {
                classify_image: String::new(),
                classify_cmd: String::new(),
                track_cmd: String::new(),
                wallaby_devices: Vec::new(),
                master_tag: "Master".to_string(),
                cache_clips_bigger_than: None,
                analyse_workers: 1,
                tracking_workers: 1,
                do_retrack: false,
                filter_false_positive: false,
                false_positive_min_confidence: 0.7,
                max_tracks: 10,
                tagging: TaggingConfig {
                    min_confidence: 0.4,
                    min_tag_confidence: 0.8,
                    max_tag_novelty: 0.7,
                    min_tag_clarity: 0.2,
                    min_tag_clarity_secondary: 0.05,
                    ignore_tags: Vec::new(),
                },
            },
            audio: AudioConfig {
                analysis_command: String::new(),
                analysis_tag: "v1".to_string(),
                analysis_workers: 1,
            },
            ir: IrConfig::default(),
            trailcam: Some(TrailcamConfig {
                run_cmd: String::new(),
                trail_workers: 1,
            }),
        }
    }

    #[test]
    fn registers_processors_in_poll_order() {
        let (processors, prerequisites) = build_processors(&test_config());
        let registered: Vec<(RecordingType, String)> = processors
            .iter()
            .map(|p| (p.recording_type, p.states_label()))
            .collect();
        assert_eq!(
            registered,
            vec![
                (RecordingType::Audio, "FINISHED".to_string()),
                (RecordingType::Audio, "analyse,reprocess".to_string()),
                (RecordingType::ThermalRaw, "tracking".to_string()),
                (RecordingType::ThermalRaw, "analyse,reprocess".to_string()),
                (RecordingType::TrailcamImage, "analyse".to_string()),
            ]
        );
        // Thermal analysis polls straight after a thermal tracking success.
        assert_eq!(prerequisites, vec![(3, 2)]);
    }

    #[test]
    fn retrack_state_is_optional() {
        let mut config = test_config();
        config.thermal.do_retrack = true;
        let (processors, _) = build_processors(&config);
        assert_eq!(processors[2].states_label(), "tracking,retrack");
    }

    #[test]
    fn zero_worker_pipelines_are_skipped() {
        let mut config = test_config();
        config.thermal.tracking_workers = 0;
        config.trailcam = None;
        let (processors, prerequisites) = build_processors(&config);
        let kinds: Vec<RecordingType> =
            processors.iter().map(|p| p.recording_type).collect();
        assert_eq!(
            kinds,
            vec![
                RecordingType::Audio,
                RecordingType::Audio,
                RecordingType::ThermalRaw,
            ]
        );
        // No tracking processor, so no prerequisite edge either.
        assert!(prerequisites.is_empty());
    }

    #[test]
    fn ir_pipelines_register_when_configured() {
        let mut config = test_config();
        config.ir.tracking_workers = 2;
        config.ir.analyse_workers = 1;
        let (processors, _) = build_processors(&config);
        let ir: Vec<String> = processors
            .iter()
            .filter(|p| p.recording_type == RecordingType::IrRaw)
            .map(|p| p.states_label())
            .collect();
        assert_eq!(
            ir,
            vec!["tracking,retrack".to_string(), "analyse,reprocess".to_string()]
        );
    }
}
