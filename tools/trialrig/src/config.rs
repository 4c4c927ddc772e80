use crate::devices::sim::StageLimits;
use crate::errors::RigError;
use crate::runtime::FileSystem;
use crate::runner::TrialRequest;
use crate::types::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub ledger_path: Option<PathBuf>,
    pub count: Option<u32>,
    pub name: Option<String>,
    pub buffer_length: Option<u32>,
    pub cleanup: bool,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub ledger: LedgerConfig,
    pub trials: TrialsConfig,
    pub recorder: RecorderConfig,
    pub stage: StageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrialsConfig {
    pub count: u32,
    pub cleanup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecorderConfig {
    pub name: String,
    pub buffer_length: u32,
    pub frame_rate_hz: f64,
    pub max_frames_per_session: u64,
    pub settle: SettleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettleConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageConfig {
    pub name: String,
    pub speed: f64,
    pub min: f64,
    pub max: f64,
    pub timeout_ms: u64,
    pub poll_ms: u64,
    pub setpoints: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: Option<PathBuf>,
    pub max_payload_bytes: usize,
    pub max_file_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig {
                path: PathBuf::from("trials.csv"),
            },
            trials: TrialsConfig {
                count: 10,
                cleanup: false,
            },
            recorder: RecorderConfig {
                name: "claw".to_string(),
                buffer_length: 10,
                frame_rate_hz: 10.0,
                max_frames_per_session: 200,
                settle: SettleConfig {
                    attempts: 5,
                    delay_ms: 100,
                },
            },
            stage: StageConfig {
                name: "rot".to_string(),
                speed: 10.0,
                min: -180.0,
                max: 180.0,
                timeout_ms: 30_000,
                poll_ms: 20,
                setpoints: vec![0.0, 5.0, 0.0],
            },
            logging: LoggingConfig {
                path: None,
                max_payload_bytes: crate::logging::DEFAULT_MAX_PAYLOAD_BYTES,
                max_file_bytes: crate::logging::DEFAULT_MAX_FILE_BYTES,
            },
        }
    }
}

impl AppConfig {
    pub fn settle_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.recorder.settle.attempts,
            delay: Duration::from_millis(self.recorder.settle.delay_ms),
        }
    }

    pub fn stage_limits(&self) -> StageLimits {
        StageLimits {
            min: self.stage.min,
            max: self.stage.max,
            speed: self.stage.speed,
            timeout: Duration::from_millis(self.stage.timeout_ms),
            poll: Duration::from_millis(self.stage.poll_ms),
        }
    }

    pub fn trial_request(&self) -> Result<TrialRequest, RigError> {
        let buffer_length = NonZeroU32::new(self.recorder.buffer_length).ok_or_else(|| {
            RigError::InvalidConfig("recorder.buffer_length must be greater than zero".to_string())
        })?;
        Ok(TrialRequest {
            count: self.trials.count,
            ledger_path: self.ledger.path.clone(),
            name: self.recorder.name.clone(),
            buffer_length,
            cleanup: self.trials.cleanup,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    ledger: Option<PartialLedgerConfig>,
    trials: Option<PartialTrialsConfig>,
    recorder: Option<PartialRecorderConfig>,
    stage: Option<PartialStageConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLedgerConfig {
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialTrialsConfig {
    count: Option<u32>,
    cleanup: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRecorderConfig {
    name: Option<String>,
    buffer_length: Option<u32>,
    frame_rate_hz: Option<f64>,
    max_frames_per_session: Option<u64>,
    settle: Option<PartialSettleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSettleConfig {
    attempts: Option<u32>,
    delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStageConfig {
    name: Option<String>,
    speed: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    timeout_ms: Option<u64>,
    poll_ms: Option<u64>,
    setpoints: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    max_file_bytes: Option<u64>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<AppConfig, RigError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(&absolutize_path(process_cwd, path))?;
        let partial: PartialAppConfig =
            toml::from_str(&file_contents).map_err(|e| RigError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);

    cfg.ledger.path = absolutize_path(process_cwd, &cfg.ledger.path);
    cfg.logging.path = cfg
        .logging
        .path
        .as_deref()
        .map(|path| absolutize_path(process_cwd, path));

    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(ledger) = partial.ledger {
        if let Some(path) = ledger.path {
            cfg.ledger.path = path;
        }
    }

    if let Some(trials) = partial.trials {
        if let Some(count) = trials.count {
            cfg.trials.count = count;
        }
        if let Some(cleanup) = trials.cleanup {
            cfg.trials.cleanup = cleanup;
        }
    }

    if let Some(recorder) = partial.recorder {
        if let Some(value) = recorder.name {
            cfg.recorder.name = value;
        }
        if let Some(value) = recorder.buffer_length {
            cfg.recorder.buffer_length = value;
        }
        if let Some(value) = recorder.frame_rate_hz {
            cfg.recorder.frame_rate_hz = value;
        }
        if let Some(value) = recorder.max_frames_per_session {
            cfg.recorder.max_frames_per_session = value;
        }
        if let Some(settle) = recorder.settle {
            if let Some(value) = settle.attempts {
                cfg.recorder.settle.attempts = value;
            }
            if let Some(value) = settle.delay_ms {
                cfg.recorder.settle.delay_ms = value;
            }
        }
    }

    if let Some(stage) = partial.stage {
        if let Some(value) = stage.name {
            cfg.stage.name = value;
        }
        if let Some(value) = stage.speed {
            cfg.stage.speed = value;
        }
        if let Some(value) = stage.min {
            cfg.stage.min = value;
        }
        if let Some(value) = stage.max {
            cfg.stage.max = value;
        }
        if let Some(value) = stage.timeout_ms {
            cfg.stage.timeout_ms = value;
        }
        if let Some(value) = stage.poll_ms {
            cfg.stage.poll_ms = value;
        }
        if let Some(value) = stage.setpoints {
            cfg.stage.setpoints = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(path) = logging.path {
            cfg.logging.path = Some(path);
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.max_file_bytes {
            cfg.logging.max_file_bytes = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.ledger_path {
        cfg.ledger.path = path.clone();
    }
    if let Some(count) = overrides.count {
        cfg.trials.count = count;
    }
    if let Some(name) = &overrides.name {
        cfg.recorder.name = name.clone();
    }
    if let Some(buffer_length) = overrides.buffer_length {
        cfg.recorder.buffer_length = buffer_length;
    }
    if overrides.cleanup {
        cfg.trials.cleanup = true;
    }
    if let Some(path) = &overrides.log_path {
        cfg.logging.path = Some(path.clone());
    }
}

pub fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), RigError> {
    if cfg.recorder.buffer_length == 0 {
        return Err(RigError::InvalidConfig(
            "recorder.buffer_length must be greater than zero".to_string(),
        ));
    }

    if cfg.recorder.settle.attempts == 0 {
        return Err(RigError::InvalidConfig(
            "recorder.settle.attempts must be greater than zero".to_string(),
        ));
    }

    let name = cfg.recorder.name.trim();
    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(RigError::InvalidConfig(
            "recorder.name must be a non-empty file name stem".to_string(),
        ));
    }

    if !(cfg.recorder.frame_rate_hz.is_finite() && cfg.recorder.frame_rate_hz > 0.0) {
        return Err(RigError::InvalidConfig(
            "recorder.frame_rate_hz must be positive".to_string(),
        ));
    }

    if !(cfg.stage.speed.is_finite() && cfg.stage.speed > 0.0) {
        return Err(RigError::InvalidConfig(
            "stage.speed must be positive".to_string(),
        ));
    }

    if cfg.stage.poll_ms == 0 {
        return Err(RigError::InvalidConfig(
            "stage.poll_ms must be greater than zero".to_string(),
        ));
    }

    if !(cfg.stage.min.is_finite() && cfg.stage.max.is_finite()) {
        return Err(RigError::InvalidConfig(
            "stage.min and stage.max must be finite".to_string(),
        ));
    }

    if cfg
        .stage
        .min
        .partial_cmp(&cfg.stage.max)
        .map_or(true, |order| order.is_gt())
    {
        return Err(RigError::InvalidConfig(
            "stage.min must not exceed stage.max".to_string(),
        ));
    }

    if cfg.stage.setpoints.is_empty() {
        return Err(RigError::InvalidConfig(
            "stage.setpoints must list at least one target".to_string(),
        ));
    }

    if let Some(target) = cfg
        .stage
        .setpoints
        .iter()
        .find(|target| !(cfg.stage.min..=cfg.stage.max).contains(*target))
    {
        return Err(RigError::InvalidConfig(format!(
            "stage setpoint {target} is outside [{}, {}]",
            cfg.stage.min, cfg.stage.max
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{load_config, CliOverrides};
    use crate::errors::RigError;
    use crate::runtime::FakeFileSystem;
    use std::path::{Path, PathBuf};

    #[test]
    fn defaults_resolve_ledger_against_cwd() {
        let cfg = load_config(
            &CliOverrides::default(),
            Path::new("/lab"),
            &FakeFileSystem::default(),
        )
        .expect("config");
        assert_eq!(cfg.ledger.path, PathBuf::from("/lab/trials.csv"));
        assert_eq!(cfg.recorder.buffer_length, 10);
        assert_eq!(cfg.settle_policy().attempts, 5);
    }

    #[test]
    fn file_values_merge_then_cli_wins() {
        let fs = FakeFileSystem::with_file(
            "/lab/rig.toml",
            r#"
[ledger]
path = "/data/claw.csv"
[trials]
count = 40
[recorder]
name = "feed"
buffer_length = 4
[recorder.settle]
delay_ms = 5
[stage]
setpoints = [0.0, 30.0, 0.0]
"#,
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("rig.toml")),
            count: Some(3),
            cleanup: true,
            ..CliOverrides::default()
        };
        let cfg = load_config(&overrides, Path::new("/lab"), &fs).expect("config");

        assert_eq!(cfg.ledger.path, PathBuf::from("/data/claw.csv"));
        assert_eq!(cfg.trials.count, 3);
        assert!(cfg.trials.cleanup);
        assert_eq!(cfg.recorder.name, "feed");
        assert_eq!(cfg.recorder.settle.attempts, 5);
        assert_eq!(cfg.recorder.settle.delay_ms, 5);
        assert_eq!(cfg.stage.setpoints, vec![0.0, 30.0, 0.0]);

        let request = cfg.trial_request().expect("request");
        assert_eq!(request.buffer_length.get(), 4);
    }

    #[test]
    fn zero_buffer_length_is_rejected() {
        let overrides = CliOverrides {
            buffer_length: Some(0),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, Path::new("/lab"), &FakeFileSystem::default())
            .expect_err("invalid");
        assert!(matches!(err, RigError::InvalidConfig(_)));
    }

    #[test]
    fn setpoints_must_respect_stage_limits() {
        let fs = FakeFileSystem::with_file(
            "/lab/rig.toml",
            "[stage]\nmin = 0.0\nmax = 10.0\nsetpoints = [5.0, 12.0]\n",
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/lab/rig.toml")),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, Path::new("/lab"), &fs).expect_err("invalid");
        assert!(format!("{err}").contains("12"));
    }

    #[test]
    fn infinite_stage_limits_are_rejected() {
        let fs = FakeFileSystem::with_file(
            "/lab/rig.toml",
            "[stage]\nmin = -inf\nmax = inf\nsetpoints = [0.0, 1e308]\n",
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/lab/rig.toml")),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, Path::new("/lab"), &fs).expect_err("invalid");
        assert!(err.to_string().contains("must be finite"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let fs = FakeFileSystem::with_file("/lab/rig.toml", "[trials\ncount = 1");
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/lab/rig.toml")),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, Path::new("/lab"), &fs).expect_err("parse");
        assert!(matches!(err, RigError::ConfigParse(_)));
    }
}
