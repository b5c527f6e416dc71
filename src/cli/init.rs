//! recur init command implementation
//!
//! Creates the data directory and a default `config.toml`.

use std::path::PathBuf;

use crate::error::Result;
use crate::output::{emit_success, HumanOutput, OutputOptions};

use super::{resolve_storage, GlobalOptions};

#[derive(serde::Serialize)]
struct InitReport {
    data_dir: PathBuf,
    config: PathBuf,
    created: bool,
}

pub fn run(global: GlobalOptions) -> Result<()> {
    let storage = resolve_storage(global.dir)?;
    let created = storage.init()?;
    // Surface a broken config now rather than on the first real command.
    storage.load_config()?;

    let report = InitReport {
        data_dir: storage.root().to_path_buf(),
        config: storage.config_file(),
        created,
    };

    let header = if created {
        "recur init: initialized"
    } else {
        "recur init: nothing to do"
    };
    let mut human = HumanOutput::new(header);
    human.push_summary("data dir", report.data_dir.display().to_string());
    human.push_summary("config", report.config.display().to_string());
    human.push_next_step("recur template add <title> --deadline <date> --every <months>");

    emit_success(
        OutputOptions {
            json: global.json,
            quiet: global.quiet,
        },
        "init",
        &report,
        Some(&human),
    )
}
