#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tempfile::TempDir;

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    /// Last stdout line parsed as JSON.
    pub fn json(&self) -> Value {
        let line = self
            .stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_else(|| panic!("no stdout; log: {}", self.log_path.display()));
        serde_json::from_str(line)
            .unwrap_or_else(|e| panic!("stdout is not JSON ({e}); log: {}", self.log_path.display()))
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Isolated home, config file, database, and event log for one test.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: PathBuf,
    pub database: PathBuf,
    pub event_log: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_extra_config("")
    }

    /// Extra TOML is appended after the generated `[storage]` and `[logging]` tables.
    pub fn with_extra_config(extra: &str) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let database = dir.path().join("data").join("alerts.sqlite3");
        let event_log = dir.path().join("data").join("events.jsonl");
        let config = dir.path().join("config.toml");
        let body = format!(
            "[storage]\ndatabase = {:?}\n\n[logging]\nenabled = true\nevent_log = {:?}\n\n{extra}",
            database.to_string_lossy(),
            event_log.to_string_lossy(),
        );
        fs::write(&config, body).expect("write test config");
        Self {
            dir,
            config,
            database,
            event_log,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn run(&self, case_name: &str, args: &[&str]) -> CmdResult {
        let config = self.config.to_string_lossy().into_owned();
        let mut full: Vec<&str> = vec!["--config", &config];
        full.extend_from_slice(args);
        run_cli_case(case_name, self.path(), &full)
    }

    pub fn event_lines(&self) -> Vec<Value> {
        let raw = fs::read_to_string(&self.event_log).unwrap_or_default();
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).expect("event line is JSON"))
            .collect()
    }
}

pub fn run_cli_case(case_name: &str, home: &Path, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("alert-ingest-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = PathBuf::from(env!("CARGO_BIN_EXE_alert-ingest"));

    let mut command = Command::new(&bin_path);
    command
        .args(args)
        .env("HOME", home)
        .env("RUST_BACKTRACE", "1");
    for (key, _) in std::env::vars() {
        if key.starts_with("ALERT_INGEST_") {
            command.env_remove(key);
        }
    }
    let output = command.output().expect("execute alert-ingest command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}
