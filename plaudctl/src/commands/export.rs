use std::fs;
use std::sync::Arc;

use chrono::Utc;
use plaud_core::{
    load_settings, save_settings, ExportSettings, Exporter, StatusUpdate,
};
use tokio::sync::mpsc;

use crate::{AppError, Cli, OutputFormat, Result, RunArgs};

pub fn execute(cli: &Cli, args: &RunArgs) -> Result<()> {
    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(crate::default_settings_path);
    let mut settings = if settings_path.exists() {
        load_settings(&settings_path)?
    } else {
        ExportSettings::default()
    };
    apply_overrides(&mut settings, args);
    settings.validate()?;

    // Persist the merged settings before the run, the same way a directory
    // picked interactively would be remembered for next time.
    if let Some(parent) = settings_path.parent() {
        fs::create_dir_all(parent)?;
    }
    save_settings(&settings_path, &settings)?;
    fs::create_dir_all(&settings.download_dir)?;

    let format = cli.format;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let (tx, mut rx) = mpsc::unbounded_channel::<StatusUpdate>();
        let printer = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                render_update(&update, format);
            }
        });

        let exporter = Exporter::new(settings, Arc::new(tx));
        let outcome = {
            let run = exporter.run();
            tokio::pin!(run);
            loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    signal = tokio::signal::ctrl_c() => {
                        if signal.is_ok() {
                            eprintln!("cancel requested, finishing up...");
                            exporter.cancel().await;
                        }
                    }
                }
            }
        };
        drop(exporter);
        let _ = printer.await;

        match outcome {
            Ok(summary) => {
                println!(
                    "exported {} of {} recording(s), {} error(s)",
                    summary.success, summary.total, summary.error
                );
                Ok(())
            }
            Err(err) => Err(AppError::Export(err)),
        }
    })
}

fn apply_overrides(settings: &mut ExportSettings, args: &RunArgs) {
    if let Some(dir) = &args.download_dir {
        settings.download_dir = dir.clone();
    }
    if let Some(delay) = args.delay_ms {
        settings.delay_ms = delay;
    }
    if let Some(max) = args.max_recordings {
        settings.max_recordings = max;
    }
    if args.headless {
        settings.headless = true;
    }
    if args.fresh_profile {
        settings.use_existing_profile = false;
    }
    if let Some(url) = &args.target_url {
        settings.target_url = url.clone();
    }
}

fn render_update(update: &StatusUpdate, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string(update) {
                println!("{json}");
            }
        }
        OutputFormat::Text => {
            let stamp = Utc::now().format("%H:%M:%S");
            match (update.current, update.total) {
                (Some(current), Some(total)) => println!(
                    "{stamp} [{}] {} ({current}/{total})",
                    update.status, update.message
                ),
                _ => println!("{stamp} [{}] {}", update.status, update.message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn overrides_replace_only_provided_fields() {
        let mut settings = ExportSettings::default();
        let args = RunArgs {
            download_dir: Some(PathBuf::from("/tmp/exports")),
            max_recordings: Some(4),
            fresh_profile: true,
            ..RunArgs::default()
        };
        apply_overrides(&mut settings, &args);

        assert_eq!(settings.download_dir, PathBuf::from("/tmp/exports"));
        assert_eq!(settings.max_recordings, 4);
        assert!(!settings.use_existing_profile);
        // Untouched knobs keep their configured values.
        assert_eq!(settings.delay_ms, 1000);
        assert!(!settings.headless);
    }
}
