use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ExportSettings;

use super::capture::sweep_directory;
use super::discovery::{find_recordings, on_recordings_list};
use super::driver::{ItemHandle, Locator, UiDriver};
use super::error::{ExportError, ExportResult};
use super::progress::{ProgressSink, RunStatus, StatusUpdate};
use super::readiness::wait_for_recordings;
use super::session::{sweep_temp_profiles, BrowserSession, SessionLauncher, SessionTeardown};
use super::workflow::run_export_workflow;

/// Cooperative cancellation flag, part of the run context rather than any
/// ambient global. Polled at the readiness gate and at each per-item loop
/// boundary; a UI step in flight runs to completion or its own timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub success: usize,
    pub error: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct RunCounters {
    success: usize,
    error: usize,
}

/// `max_recordings > 0` caps the batch; any other value exports everything
/// discovered.
pub fn resolved_export_count(max_recordings: i64, discovered: usize) -> usize {
    if max_recordings > 0 {
        (max_recordings as usize).min(discovered)
    } else {
        discovered
    }
}

const HOME_CONTROLS: &[Locator<'static>] = &[
    Locator::css(".logo"),
    Locator::css(".home-button"),
    Locator::css(".brand-logo"),
    Locator::css("a[href=\"/\"]"),
    Locator::css("a[href=\"/home\"]"),
    Locator::css("a[href=\"/files\"]"),
    Locator::css("a[href=\"/recordings\"]"),
];

const BACK_CONTROLS: &[Locator<'static>] = &[
    Locator::with_text("button", "Back"),
    Locator::css("[aria-label=\"Back\"]"),
    Locator::css(".back-button"),
    Locator::css(".nav-back"),
    Locator::css(".iconfont.icon-back"),
    Locator::css(".iconfont.icon-return"),
];

const NAV_LINKS: &[Locator<'static>] = &[
    Locator::with_text("a", "Recordings"),
    Locator::with_text("a", "Files"),
    Locator::with_text("a", "Library"),
    Locator::with_text(".nav-item", "Recordings"),
    Locator::with_text(".nav-item", "Files"),
    Locator::with_text(".nav-item", "Library"),
];

/// Gets the page back to the recordings list after a detail view or export
/// dialog swallowed it: home control, back control, named navigation link,
/// browser history, and finally a full reload.
pub(crate) async fn recover_to_list<D: UiDriver + ?Sized>(
    driver: &mut D,
    settings: &ExportSettings,
) -> ExportResult<()> {
    let half = settings.delay() / 2;
    for group in [HOME_CONTROLS, BACK_CONTROLS, NAV_LINKS] {
        for locator in group {
            if driver.click_first(*locator).await? {
                debug!(css = locator.css, "recovery control clicked");
                sleep(half).await;
                return Ok(());
            }
        }
    }
    debug!("no navigation control matched, using browser history");
    driver.history_back().await?;
    sleep(half).await;
    if !on_recordings_list(driver).await {
        debug!("history navigation did not restore the list, reloading");
        driver.reload().await?;
    }
    Ok(())
}

enum ItemFlow {
    Continue,
    Abort,
}

/// The session-agnostic run loop: navigation, readiness gate, discovery and
/// the per-recording batch. Public so embedders (and tests) can drive it
/// against any [`UiDriver`]; [`Exporter::run`] wraps it with session
/// lifecycle and finalization.
pub async fn drive_export<D: UiDriver + ?Sized>(
    driver: &mut D,
    settings: &ExportSettings,
    cancel: &CancelToken,
    sink: &dyn ProgressSink,
) -> ExportResult<RunSummary> {
    sink.publish(StatusUpdate::new(
        RunStatus::Navigating,
        format!("Navigating to {}...", settings.target_url),
    ));
    driver.navigate(&settings.target_url).await?;

    sink.publish(StatusUpdate::new(
        RunStatus::WaitingLogin,
        login_message(settings),
    ));
    wait_for_recordings(driver, cancel, sink).await?;
    if cancel.is_canceled() {
        return Err(ExportError::Canceled);
    }

    info!("looking for recordings");
    sink.publish(StatusUpdate::new(
        RunStatus::Finding,
        "Looking for recordings...",
    ));
    let mut items = find_recordings(driver).await;
    if items.is_empty() {
        return Err(ExportError::NoRecordings);
    }
    info!(count = items.len(), "recordings found");
    sink.publish(
        StatusUpdate::new(
            RunStatus::Found,
            format!("Found {} recordings", items.len()),
        )
        .with_total(items.len()),
    );

    let count = resolved_export_count(settings.max_recordings, items.len());
    info!(count, "resolved export count");
    sink.publish(
        StatusUpdate::new(
            RunStatus::Exporting,
            format!("Will export {count} recordings"),
        )
        .with_progress(0, count),
    );

    let mut counters = RunCounters::default();
    for index in 0..count {
        if cancel.is_canceled() {
            return Err(ExportError::Canceled);
        }
        let ordinal = index + 1;
        info!(ordinal, count, "processing recording");
        sink.publish(
            StatusUpdate::new(
                RunStatus::Processing,
                format!("Processing recording {ordinal} of {count}"),
            )
            .with_progress(ordinal, count),
        );
        match process_item(driver, settings, sink, &mut items, index, count, &mut counters).await {
            ItemFlow::Continue => {}
            ItemFlow::Abort => break,
        }
    }

    Ok(RunSummary {
        success: counters.success,
        error: counters.error,
        total: count,
    })
}

async fn process_item<D: UiDriver + ?Sized>(
    driver: &mut D,
    settings: &ExportSettings,
    sink: &dyn ProgressSink,
    items: &mut Vec<ItemHandle>,
    index: usize,
    count: usize,
    counters: &mut RunCounters,
) -> ItemFlow {
    match attempt_item(driver, settings, sink, items, index, count, counters).await {
        Ok(()) => ItemFlow::Continue,
        Err(err) => {
            let ordinal = index + 1;
            counters.error += 1;
            warn!(ordinal, error = %err, "error processing recording");
            sink.publish(
                StatusUpdate::new(
                    RunStatus::Error,
                    format!("Error processing recording {ordinal}: {err}"),
                )
                .with_progress(ordinal, count),
            );
            match recover_to_list(driver, settings).await {
                Ok(()) => {
                    sleep(settings.delay()).await;
                    refresh_items(driver, items).await;
                    ItemFlow::Continue
                }
                Err(nav_err) => {
                    error!(error = %nav_err, "failed to recover the recordings list, aborting batch");
                    ItemFlow::Abort
                }
            }
        }
    }
}

async fn attempt_item<D: UiDriver + ?Sized>(
    driver: &mut D,
    settings: &ExportSettings,
    sink: &dyn ProgressSink,
    items: &mut Vec<ItemHandle>,
    index: usize,
    count: usize,
    counters: &mut RunCounters,
) -> ExportResult<()> {
    let ordinal = index + 1;
    let handle = items.get(index).copied().ok_or(ExportError::StaleItem)?;
    driver.click_item(handle).await?;
    sleep(settings.delay()).await;

    if run_export_workflow(driver, settings).await {
        counters.success += 1;
        info!(ordinal, "export initiated");
        sink.publish(
            StatusUpdate::new(
                RunStatus::Downloading,
                format!("Successfully initiated download for recording {ordinal}"),
            )
            .with_progress(ordinal, count),
        );
        sleep(settings.delay() / 2).await;
    } else {
        counters.error += 1;
        warn!(ordinal, "could not find export controls");
        sink.publish(
            StatusUpdate::new(
                RunStatus::Error,
                format!("Could not find download button for recording {ordinal}"),
            )
            .with_progress(ordinal, count),
        );
    }

    if !on_recordings_list(driver).await {
        debug!("left the recordings list, navigating back");
        recover_to_list(driver, settings).await?;
        sleep(settings.delay()).await;
        refresh_items(driver, items).await;
    }
    Ok(())
}

/// Replaces the working item set after a list refresh. Already-processed
/// indices are not revisited; an empty re-discovery keeps the stale handles
/// so the per-item error path reports them instead of silently stopping.
async fn refresh_items<D: UiDriver + ?Sized>(driver: &mut D, items: &mut Vec<ItemHandle>) {
    let fresh = find_recordings(driver).await;
    if !fresh.is_empty() {
        *items = fresh;
    }
}

fn login_message(settings: &ExportSettings) -> &'static str {
    if settings.use_existing_profile {
        "Please log in and navigate to the recordings page. Using your existing \
         browser profile for better passkey support. A blue dialog will appear in \
         the browser window with an \"I'm Ready\" button you can click when you're \
         on the recordings page."
    } else {
        "Please log in and navigate to the recordings page. If you have trouble \
         with passkey login, try enabling use_existing_profile in your settings. \
         A blue dialog will appear in the browser window with an \"I'm Ready\" \
         button you can click when you're on the recordings page."
    }
}

fn emit_terminal(sink: &dyn ProgressSink, outcome: &ExportResult<RunSummary>) {
    match outcome {
        Ok(summary) => {
            info!(
                success = summary.success,
                errors = summary.error,
                "export complete"
            );
            sink.publish(
                StatusUpdate::new(RunStatus::Complete, "Export complete!")
                    .with_total(summary.total)
                    .with_counts(summary.success, summary.error),
            );
        }
        Err(ExportError::Canceled) => {
            info!("export run canceled");
            sink.publish(StatusUpdate::new(RunStatus::Canceled, "Export canceled"));
        }
        Err(err) => {
            error!(error = %err, "export run failed");
            sink.publish(StatusUpdate::new(RunStatus::Error, format!("Error: {err}")));
        }
    }
}

/// Owns the one-run-at-a-time latch, the cancel flag and the active-session
/// slot. The host keeps one of these alive for the lifetime of the app and
/// calls [`run`](Self::run) / [`cancel`](Self::cancel).
pub struct Exporter {
    settings: Arc<ExportSettings>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancelToken,
    active: Arc<AtomicBool>,
    session_slot: Arc<AsyncMutex<Option<SessionTeardown>>>,
}

impl Exporter {
    pub fn new(settings: ExportSettings, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            settings: Arc::new(settings),
            sink,
            cancel: CancelToken::new(),
            active: Arc::new(AtomicBool::new(false)),
            session_slot: Arc::new(AsyncMutex::new(None)),
        }
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Requests cooperative cancellation. The flag is observed at the next
    /// checkpoint; session resources are additionally torn down here,
    /// best-effort, without waiting for the run flow to notice.
    pub async fn cancel(&self) {
        if !self.is_active() {
            warn!("no export run active");
            return;
        }
        info!("canceling export run");
        self.cancel.trigger();
        if let Some(teardown) = self.session_slot.lock().await.take() {
            teardown.shutdown().await;
        }
    }

    /// Runs one export batch end to end. A second call while one is active
    /// is rejected immediately, never queued.
    pub async fn run(&self) -> ExportResult<RunSummary> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("export run already active, rejecting start request");
            return Err(ExportError::AlreadyRunning);
        }
        self.cancel.reset();
        let outcome = self.execute().await;
        self.session_slot.lock().await.take();
        self.active.store(false, Ordering::SeqCst);
        outcome
    }

    async fn execute(&self) -> ExportResult<RunSummary> {
        let run_id = Uuid::new_v4();
        info!(run_id = %run_id, "starting export run");
        self.sink.publish(StatusUpdate::new(
            RunStatus::Starting,
            "Starting export process...",
        ));

        let launching = if self.settings.use_existing_profile {
            "Launching browser with existing profile..."
        } else {
            "Launching browser..."
        };
        self.sink
            .publish(StatusUpdate::new(RunStatus::Launching, launching));

        let launcher = SessionLauncher::new(Arc::clone(&self.settings));
        let mut session = match launcher.launch().await {
            Ok(session) => session,
            Err(err) => {
                error!(error = %err, "browser launch failed");
                // No session came up, but the attempt may have left a
                // half-created profile directory behind.
                sweep_temp_profiles(&self.settings.download_dir);
                let outcome = Err(err);
                emit_terminal(self.sink.as_ref(), &outcome);
                return outcome;
            }
        };
        *self.session_slot.lock().await = Some(session.teardown_handle());

        let outcome =
            drive_export(&mut session, &self.settings, &self.cancel, self.sink.as_ref()).await;
        self.finalize(&mut session, &outcome).await;
        outcome
    }

    /// Always runs once a session exists, success or failure: filename
    /// sweep, exactly one terminal status, then resource teardown.
    async fn finalize(&self, session: &mut BrowserSession, outcome: &ExportResult<RunSummary>) {
        let renamed = sweep_directory(&self.settings.download_dir);
        if renamed > 0 {
            info!(renamed, "normalized leftover filenames after run");
        }
        emit_terminal(self.sink.as_ref(), outcome);
        if self.settings.headless {
            session.close(true).await;
        } else {
            session.close(false).await;
            self.sink.publish(StatusUpdate::new(
                RunStatus::BrowserOpen,
                "Browser is kept open for inspection. You can close it manually.",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        updates: Mutex<Vec<StatusUpdate>>,
    }

    impl ProgressSink for CollectingSink {
        fn publish(&self, update: StatusUpdate) {
            self.updates.lock().unwrap().push(update);
        }
    }

    #[test]
    fn unbounded_max_exports_everything_discovered() {
        assert_eq!(resolved_export_count(-1, 0), 0);
        assert_eq!(resolved_export_count(-1, 7), 7);
        assert_eq!(resolved_export_count(0, 7), 7);
    }

    #[test]
    fn positive_max_caps_at_discovered_count() {
        assert_eq!(resolved_export_count(3, 10), 3);
        assert_eq!(resolved_export_count(10, 3), 3);
        assert_eq!(resolved_export_count(5, 5), 5);
    }

    #[test]
    fn cancel_token_is_shared_and_resettable() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_canceled());
        clone.trigger();
        assert!(token.is_canceled());
        token.reset();
        assert!(!clone.is_canceled());
    }

    #[test]
    fn terminal_status_is_exactly_one_of_complete_error_canceled() {
        let sink = CollectingSink::default();
        emit_terminal(
            &sink,
            &Ok(RunSummary {
                success: 3,
                error: 0,
                total: 3,
            }),
        );
        emit_terminal(&sink, &Err(ExportError::Canceled));
        emit_terminal(&sink, &Err(ExportError::NoRecordings));

        let updates = sink.updates.lock().unwrap();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].status, RunStatus::Complete);
        assert_eq!(updates[0].success, Some(3));
        assert_eq!(updates[0].error, Some(0));
        assert_eq!(updates[0].total, Some(3));
        assert_eq!(updates[1].status, RunStatus::Canceled);
        assert_eq!(updates[2].status, RunStatus::Error);
    }
}
