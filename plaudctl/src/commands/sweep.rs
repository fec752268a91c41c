use std::path::PathBuf;

use plaud_core::{load_settings, sweep_directory, ExportSettings};
use serde::Serialize;

use crate::{Cli, OutputFormat, Result, SweepArgs};

#[derive(Debug, Serialize)]
struct SweepReport {
    dir: PathBuf,
    renamed: usize,
}

/// Standalone normalization pass, for picking up after an interrupted run.
pub fn execute(cli: &Cli, args: &SweepArgs) -> Result<()> {
    let dir = match &args.dir {
        Some(dir) => dir.clone(),
        None => {
            let settings_path = cli
                .settings
                .clone()
                .unwrap_or_else(crate::default_settings_path);
            if settings_path.exists() {
                load_settings(&settings_path)?.download_dir
            } else {
                ExportSettings::default().download_dir
            }
        }
    };

    let report = SweepReport {
        renamed: sweep_directory(&dir),
        dir,
    };
    match cli.format {
        OutputFormat::Text => println!(
            "renamed {} file(s) in {}",
            report.renamed,
            report.dir.display()
        ),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}
