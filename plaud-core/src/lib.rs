pub mod config;
pub mod error;
pub mod export;

pub use config::{
    default_download_dir, load_settings, save_settings, ExportSettings, DEFAULT_TARGET_URL,
};
pub use error::{ConfigError, Result};
pub use export::{
    drive_export, find_recordings, normalized_filename, resolved_export_count,
    run_export_workflow, sweep_directory, wait_for_recordings, BrowserSession, CancelToken,
    DirectoryWatcher, ExportError, ExportResult, Exporter, ItemHandle, Locator, ProgressSink,
    RunStatus, RunSummary, SessionLauncher, StatusUpdate, UiDriver,
};
