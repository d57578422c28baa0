//! YAML configuration for the worker host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

const CONFIG_FILENAME: &str = "processing.yaml";
const CONFIG_DIRS: &[&str] = &[".", "/etc/faunaproc"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration file found (searched {CONFIG_DIRS:?} for {CONFIG_FILENAME})")]
    NotFound,
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Top-level configuration, loaded once at startup and read-only afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api_url: String,
    pub api_user: String,
    pub api_password: String,
    pub temp_dir: PathBuf,
    #[serde(default = "default_no_recordings_wait_secs")]
    pub no_recordings_wait_secs: u64,
    #[serde(default = "default_no_job_sleep_seconds")]
    pub no_job_sleep_seconds: u64,
    /// Seconds a tracker/classifier subprocess may run before it is killed.
    #[serde(default = "default_subprocess_timeout")]
    pub subprocess_timeout: u64,
    /// Hours of uptime after which the dispatcher exits for a supervisor
    /// restart, once idle.
    #[serde(default)]
    pub restart_after: Option<f64>,
    pub thermal: ThermalConfig,
    pub audio: AudioConfig,
    #[serde(default)]
    pub ir: IrConfig,
    #[serde(default)]
    pub trailcam: Option<TrailcamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThermalConfig {
    pub classify_image: String,
    pub classify_cmd: String,
    pub track_cmd: String,
    #[serde(default)]
    pub wallaby_devices: Vec<u64>,
    #[serde(default = "default_master_tag")]
    pub master_tag: String,
    /// Clips longer than this many seconds are tracked with frame caching.
    #[serde(default)]
    pub cache_clips_bigger_than: Option<f64>,
    #[serde(default = "default_one")]
    pub analyse_workers: usize,
    #[serde(default = "default_one")]
    pub tracking_workers: usize,
    #[serde(default)]
    pub do_retrack: bool,
    #[serde(default)]
    pub filter_false_positive: bool,
    #[serde(default = "default_false_positive_min_confidence")]
    pub false_positive_min_confidence: f64,
    #[serde(default = "default_max_tracks")]
    pub max_tracks: usize,
    pub tagging: TaggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaggingConfig {
    /// Floor for whole-recording tags such as "multiple animals".
    pub min_confidence: f64,
    pub min_tag_confidence: f64,
    pub max_tag_novelty: f64,
    pub min_tag_clarity: f64,
    pub min_tag_clarity_secondary: f64,
    #[serde(default)]
    pub ignore_tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub analysis_command: String,
    pub analysis_tag: String,
    #[serde(default = "default_one")]
    pub analysis_workers: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IrConfig {
    #[serde(default)]
    pub tracking_workers: usize,
    #[serde(default)]
    pub analyse_workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrailcamConfig {
    pub run_cmd: String,
    #[serde(default = "default_one")]
    pub trail_workers: usize,
}

impl Config {
    /// Load from an explicit path, or discover `processing.yaml` in the
    /// usual locations.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => find_config()?,
        };
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout)
    }

    pub fn no_job_sleep(&self) -> Duration {
        Duration::from_secs(self.no_job_sleep_seconds)
    }

    pub fn no_recordings_wait(&self) -> Duration {
        Duration::from_secs(self.no_recordings_wait_secs)
    }

    pub fn restart_after(&self) -> Option<Duration> {
        self.restart_after
            .map(|hours| Duration::from_secs_f64(hours * 60.0 * 60.0))
    }
}

fn find_config() -> Result<PathBuf, ConfigError> {
    for dir in CONFIG_DIRS {
        let path = Path::new(dir).join(CONFIG_FILENAME);
        if path.is_file() {
            return Ok(path);
        }
    }
    Err(ConfigError::NotFound)
}

fn default_no_recordings_wait_secs() -> u64 {
    30
}

fn default_no_job_sleep_seconds() -> u64 {
    30
}

fn default_subprocess_timeout() -> u64 {
    20 * 60
}

fn default_master_tag() -> String {
    "Master".to_string()
}

fn default_one() -> usize {
    1
}

fn default_false_positive_min_confidence() -> f64 {
    0.7
}

fn default_max_tracks() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
api_url: "https://api-test.faunawatch.nz"
api_user: "processor@faunawatch.nz"
api_password: "hunter2"
temp_dir: "/var/cache/faunaproc"
no_recordings_wait_secs: 60
restart_after: 12
thermal:
  classify_image: "classifier:latest"
  classify_cmd: "classify {source} --cache {cache}"
  track_cmd: "track {source} --retrack {retrack}"
  wallaby_devices: [12, 88]
  do_retrack: true
  filter_false_positive: true
  max_tracks: 8
  tagging:
    min_confidence: 0.4
    min_tag_confidence: 0.8
    max_tag_novelty: 0.7
    min_tag_clarity: 0.2
    min_tag_clarity_secondary: 0.05
    ignore_tags: ["not"]
audio:
  analysis_command: "analyse {folder}/{basename}"
  analysis_tag: "v1.2.0"
  analysis_workers: 2
ir:
  tracking_workers: 1
trailcam:
  run_cmd: "detect {folder}/{basename} --out {outfile}"
"#;

    #[test]
    fn parses_full_config() {
        let config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.no_recordings_wait_secs, 60);
        assert_eq!(config.no_job_sleep_seconds, 30);
        assert_eq!(config.subprocess_timeout(), Duration::from_secs(1200));
        assert_eq!(config.restart_after(), Some(Duration::from_secs(12 * 3600)));
        assert_eq!(config.thermal.wallaby_devices, vec![12, 88]);
        assert_eq!(config.thermal.master_tag, "Master");
        assert_eq!(config.thermal.max_tracks, 8);
        assert!(config.thermal.do_retrack);
        assert_eq!(config.thermal.tagging.ignore_tags, vec!["not"]);
        assert_eq!(config.audio.analysis_workers, 2);
        assert_eq!(config.ir.tracking_workers, 1);
        assert_eq!(config.ir.analyse_workers, 0);
        assert_eq!(config.trailcam.as_ref().unwrap().trail_workers, 1);
    }

    #[test]
    fn restart_after_defaults_to_none() {
        let trimmed = EXAMPLE.replace("restart_after: 12\n", "");
        let config: Config = serde_yaml::from_str(&trimmed).unwrap();
        assert_eq!(config.restart_after(), None);
    }
}
