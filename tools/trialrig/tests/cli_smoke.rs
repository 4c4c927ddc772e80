use assert_cmd::cargo::cargo_bin_cmd;
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use trialrig::run_with_runtime;
use trialrig::runtime::{FakeClock, FakeFileSystem, FakeTerminal, FileSystem, ProductionRuntime};
use trialrig::signal::CancelToken;

const FAST_CONFIG: &str = r#"
[ledger]
path = "trials.csv"

[trials]
count = 3

[recorder]
name = "claw"
buffer_length = 2
frame_rate_hz = 50.0

[recorder.settle]
attempts = 3
delay_ms = 5

[stage]
speed = 1000.0
poll_ms = 1
setpoints = [0.0, 2.0, 0.0]
"#;

fn args(list: &[&str]) -> Vec<OsString> {
    list.iter().map(OsString::from).collect()
}

fn fake_runtime(fs: &FakeFileSystem, terminal: &FakeTerminal) -> ProductionRuntime {
    ProductionRuntime {
        clock: Arc::new(FakeClock::default()),
        file_system: Arc::new(fs.clone()),
        terminal: Arc::new(terminal.clone()),
        cancel: CancelToken::new(),
    }
}

#[test]
fn help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("trialrig");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");

    assert!(stdout.contains("init"));
    assert!(stdout.contains("run"));
    assert!(stdout.contains("stats"));
}

#[test]
fn init_run_and_stats_against_simulated_devices() {
    let fs = FakeFileSystem::default();
    let terminal = FakeTerminal::new();
    let runtime = fake_runtime(&fs, &terminal);
    let cwd = Path::new("/lab");

    let code = run_with_runtime(&args(&["trialrig", "init"]), cwd, &runtime).expect("init");
    assert_eq!(code, 0);
    let code = run_with_runtime(&args(&["trialrig", "run", "--count", "3"]), cwd, &runtime)
        .expect("run");
    assert_eq!(code, 0);

    assert_eq!(
        fs.read_to_string(Path::new("/lab/trials.csv")).expect("ledger"),
        "attempted,succeeded,failed\n3,3,0\n"
    );
    for slot in ["00", "01", "02"] {
        let frames = fs
            .matching_files(&Path::new("/lab/movies00000").join(slot), "claw")
            .expect("frames");
        assert_eq!(frames.len(), 10, "slot {slot}");
    }

    let code = run_with_runtime(&args(&["trialrig", "stats"]), cwd, &runtime).expect("stats");
    assert_eq!(code, 0);
    let lines = terminal.written_lines();
    assert_eq!(lines[0], "created ledger /lab/trials.csv");
    assert!(lines.iter().any(|line| line == "starting round 2 of 3"));
    assert!(lines.iter().any(|line| line == "runs: 1"));
    assert!(lines
        .iter()
        .any(|line| line == "successful trials since last failure: 3"));
}

#[test]
fn setpoint_outside_soft_limits_is_rejected_before_any_trial() {
    let fs = FakeFileSystem::with_file(
        "/lab/rig.toml",
        "[stage]\nmin = -10.0\nmax = 10.0\nsetpoints = [0.0, 20.0]\n",
    );
    fs.write_string(Path::new("/lab/trials.csv"), "attempted,succeeded,failed\n")
        .expect("seed ledger");
    let terminal = FakeTerminal::new();
    let runtime = fake_runtime(&fs, &terminal);

    let err = run_with_runtime(
        &args(&["trialrig", "--config", "rig.toml", "run"]),
        Path::new("/lab"),
        &runtime,
    )
    .expect_err("setpoint outside limits");
    assert!(err.to_string().contains("stage setpoint 20 is outside"));
    assert!(terminal.written_lines().is_empty());
}

#[test]
fn stage_timeout_fails_the_run_with_exit_one() {
    let fs = FakeFileSystem::with_file(
        "/lab/rig.toml",
        "[stage]\nspeed = 1.0\ntimeout_ms = 1000\nsetpoints = [0.0, 5.0]\n",
    );
    fs.write_string(Path::new("/lab/trials.csv"), "attempted,succeeded,failed\n")
        .expect("seed ledger");
    let terminal = FakeTerminal::new();
    let runtime = fake_runtime(&fs, &terminal);

    let code = run_with_runtime(
        &args(&["trialrig", "--config", "rig.toml", "run", "--count", "2"]),
        Path::new("/lab"),
        &runtime,
    )
    .expect("report");

    assert_eq!(code, 1);
    assert_eq!(
        fs.read_to_string(Path::new("/lab/trials.csv")).expect("ledger"),
        "attempted,succeeded,failed\n2,0,1\n"
    );
    let lines = terminal.written_lines();
    assert!(lines.iter().any(|line| line.contains("failed at trial 0")));
    assert!(lines.iter().any(|line| line == "  /lab/movies00000/00"));
}

#[test]
fn crawling_stage_fails_its_trial_instead_of_panicking() {
    let fs = FakeFileSystem::with_file(
        "/lab/rig.toml",
        "[stage]\nspeed = 1e-300\nsetpoints = [5.0]\n",
    );
    fs.write_string(Path::new("/lab/trials.csv"), "attempted,succeeded,failed\n")
        .expect("seed ledger");
    let terminal = FakeTerminal::new();
    let runtime = fake_runtime(&fs, &terminal);

    let code = run_with_runtime(
        &args(&["trialrig", "--config", "rig.toml", "run", "--count", "2"]),
        Path::new("/lab"),
        &runtime,
    )
    .expect("report");

    assert_eq!(code, 1);
    assert_eq!(
        fs.read_to_string(Path::new("/lab/trials.csv")).expect("ledger"),
        "attempted,succeeded,failed\n2,0,1\n"
    );
    assert!(terminal
        .written_lines()
        .iter()
        .any(|line| line.contains("not representable")));
}

#[test]
fn stats_json_reports_streaks() {
    let fs = FakeFileSystem::with_file(
        "/lab/trials.csv",
        "attempted,succeeded,failed\n10,10,0\n20,7,1\n5,5,0\n",
    );
    let terminal = FakeTerminal::new();
    let runtime = fake_runtime(&fs, &terminal);

    let code = run_with_runtime(
        &args(&["trialrig", "stats", "--json"]),
        Path::new("/lab"),
        &runtime,
    )
    .expect("stats");
    assert_eq!(code, 0);

    let text = terminal.written_lines().join("\n");
    let value: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert_eq!(value["runs"], 3);
    assert_eq!(value["failures"], 1);
    assert_eq!(value["streaks"], serde_json::json!([17]));
    assert_eq!(value["open_streak"], 5);
}

#[test]
fn binary_runs_trials_in_a_scratch_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::write(temp.path().join("rig.toml"), FAST_CONFIG).expect("config");

    let mut init = cargo_bin_cmd!("trialrig");
    init.current_dir(temp.path())
        .arg("--config")
        .arg("rig.toml")
        .arg("init");
    init.assert().success();

    let mut run = cargo_bin_cmd!("trialrig");
    run.current_dir(temp.path())
        .arg("--config")
        .arg("rig.toml")
        .arg("run")
        .arg("--log")
        .arg("run.jsonl");
    let out = run.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");
    assert!(stdout.contains("starting round 0 of 3"));
    assert!(stdout.contains("attempted=3 succeeded=3"));

    let ledger = std::fs::read_to_string(temp.path().join("trials.csv")).expect("ledger");
    assert_eq!(ledger, "attempted,succeeded,failed\n3,3,0\n");
    assert!(temp.path().join("movies00000/00").is_dir());
    assert!(temp.path().join("movies00000/01").is_dir());
    assert!(!temp.path().join("movies00000/02").exists());

    let log = std::fs::read_to_string(temp.path().join("run.jsonl")).expect("log");
    assert!(log.contains("\"event_type\":\"session.opened\""));
    assert!(log.contains("\"event_type\":\"ledger.appended\""));
}

#[test]
fn binary_without_a_ledger_exits_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("trialrig");
    cmd.current_dir(temp.path()).arg("run").arg("--count").arg("1");
    let out = cmd.assert().failure();
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");
    assert!(stderr.contains("ledger format error"));
}

#[test]
fn invalid_config_path_exits_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("trialrig");
    cmd.current_dir(temp.path())
        .arg("--config")
        .arg("missing.toml")
        .arg("stats");
    cmd.assert().failure();
}
