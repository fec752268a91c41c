mod capture;
mod discovery;
mod driver;
mod error;
mod progress;
mod readiness;
mod runner;
mod session;
mod workflow;

pub use capture::{generated_recording_name, normalized_filename, sweep_directory, DirectoryWatcher};
pub use discovery::find_recordings;
pub use driver::{ItemHandle, Locator, UiDriver};
pub use error::{ExportError, ExportResult};
pub use progress::{ProgressSink, RunStatus, StatusUpdate};
pub use readiness::wait_for_recordings;
pub use runner::{drive_export, resolved_export_count, CancelToken, Exporter, RunSummary};
pub use session::{BrowserSession, SessionLauncher, SessionTeardown};
pub use workflow::run_export_workflow;
