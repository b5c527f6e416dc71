#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

/// A scratch working directory with its own `.recur/` data directory
pub struct TestDir {
    dir: TempDir,
}

impl TestDir {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        Self { dir }
    }

    /// A directory that already ran `recur init`
    pub fn initialized() -> Self {
        let dir = Self::new();
        dir.cmd().arg("init").assert().success();
        dir
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join(".recur")
    }

    /// `recur` pointed at this directory, with tracing silenced
    pub fn cmd(&self) -> Command {
        let mut cmd = recur_cmd();
        cmd.env("RECUR_DIR", self.path());
        cmd.env_remove("RUST_LOG");
        cmd
    }

    /// Run with `--json`, assert success, and return the envelope's `data`
    pub fn run_json(&self, args: &[&str]) -> Value {
        self.run_json_envelope(args)["data"].clone()
    }

    /// Run with `--json`, assert success, and return the whole envelope
    pub fn run_json_envelope(&self, args: &[&str]) -> Value {
        let output = self
            .cmd()
            .arg("--json")
            .args(args)
            .output()
            .expect("run recur");
        assert!(
            output.status.success(),
            "recur {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        let envelope: Value = serde_json::from_slice(&output.stdout).expect("json envelope");
        assert_eq!(envelope["status"], "success");
        envelope
    }

    /// Replace the template list with raw wire records
    pub fn write_templates(&self, items: Value) {
        let document = serde_json::json!({
            "schema_version": "recur.templates.v1",
            "items": items,
        });
        self.write_data_file("templates.json", &document);
    }

    /// Write `contents` verbatim as the template document
    pub fn write_raw_templates(&self, contents: &str) {
        fs::create_dir_all(self.data_dir()).expect("create data dir");
        fs::write(self.data_dir().join("templates.json"), contents).expect("write templates");
    }

    pub fn read_templates(&self) -> Value {
        self.read_data_file("templates.json")
    }

    pub fn read_occurrences(&self) -> Value {
        self.read_data_file("occurrences.json")
    }

    /// Sorted occurrence ids currently on disk
    pub fn occurrence_ids(&self) -> Vec<String> {
        let document = self.read_occurrences();
        document["occurrences"]
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn write_config(&self, contents: &str) {
        fs::create_dir_all(self.data_dir()).expect("create data dir");
        fs::write(self.data_dir().join("config.toml"), contents).expect("write config");
    }

    fn write_data_file(&self, name: &str, value: &Value) {
        fs::create_dir_all(self.data_dir()).expect("create data dir");
        let content = serde_json::to_string_pretty(value).expect("serialize");
        fs::write(self.data_dir().join(name), content).expect("write data file");
    }

    fn read_data_file(&self, name: &str) -> Value {
        let content = fs::read_to_string(self.data_dir().join(name)).expect("read data file");
        serde_json::from_str(&content).expect("parse data file")
    }
}

pub fn recur_cmd() -> Command {
    Command::cargo_bin("recur").expect("binary")
}

/// The bimonthly rent template used across tests
pub fn rent_template() -> Value {
    serde_json::json!({
        "Id": "T1",
        "Title": "Pay rent",
        "Deadline": "2024-01-15",
        "IsRecurring": true,
        "Interval": "2",
        "FinalDate": "2024-07-15",
        "ResponsibleParty": "ann;bo",
        "Priority": "Normal"
    })
}
