use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    DownloadProgressState, EventDownloadProgress, EventDownloadWillBegin,
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    GetNavigationHistoryParams, NavigateParams, NavigateToHistoryEntryParams, ReloadParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::element::Element;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use chrono::Utc;
use futures::{Stream, StreamExt};
use rand::{distributions::Alphanumeric, Rng};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::ExportSettings;

use super::capture::{finalize_download, DirectoryWatcher};
use super::driver::{ItemHandle, Locator, UiDriver};
use super::error::{ExportError, ExportResult};

pub(crate) const TEMP_PROFILE_PREFIX: &str = "temp-browser-profile-";

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(60);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
const SELECTOR_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
enum DownloadSignal {
    Started,
    Completed,
}

/// Acquires a browser session configured for download capture.
#[derive(Debug, Clone)]
pub struct SessionLauncher {
    settings: Arc<ExportSettings>,
}

impl SessionLauncher {
    pub fn new(settings: Arc<ExportSettings>) -> Self {
        Self { settings }
    }

    /// Launches the browser, wires download capture, and starts the
    /// directory watcher. Navigation to the target application is left to
    /// the caller so it can report the transition; capture registration is
    /// guaranteed to precede it.
    pub async fn launch(&self) -> ExportResult<BrowserSession> {
        let download_dir = self.settings.download_dir.clone();
        fs::create_dir_all(&download_dir)?;
        sweep_temp_profiles(&download_dir);

        let temp_profile = if self.settings.use_existing_profile {
            match host_profile_root() {
                Some(root) => {
                    info!(
                        profile = %root.display(),
                        "host browser profile detected, launching persistent session"
                    );
                    Some(create_temp_profile_dir(&download_dir)?)
                }
                None => {
                    warn!("no host browser profile found, launching isolated session");
                    None
                }
            }
        } else {
            None
        };

        let config = self.build_chromium_config(temp_profile.as_deref())?;
        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| ExportError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        // A download firing before the listener exists is unrecoverable, so
        // capture is wired before the first navigation.
        let setup = async {
            let page = browser
                .new_page(CreateTargetParams::new("about:blank"))
                .await?;
            let capture = register_download_capture(&page, &download_dir).await?;
            Ok::<_, ExportError>((page, capture))
        }
        .await;
        let (page, (download_rx, capture_task)) = match setup {
            Ok(parts) => parts,
            Err(err) => {
                // Half-created session: take the browser down before failing.
                if let Err(close_err) = browser.close().await {
                    warn!(error = %close_err, "failed to close browser after setup error");
                }
                handler_task.abort();
                return Err(err);
            }
        };
        let watcher = DirectoryWatcher::spawn(download_dir.clone());

        Ok(BrowserSession {
            browser: Arc::new(AsyncMutex::new(browser)),
            handler_task: Some(handler_task),
            capture_task: Some(capture_task),
            watcher,
            page,
            download_rx,
            download_dir,
            temp_profile,
            items: Vec::new(),
            generation: 0,
        })
    }

    fn build_chromium_config(&self, user_data_dir: Option<&Path>) -> ExportResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder()
            .viewport(ChromiumViewport {
                width: 1280,
                height: 800,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            })
            .request_timeout(OPERATION_TIMEOUT);
        if !self.settings.headless {
            builder = builder.with_head();
        }
        if let Some(dir) = user_data_dir {
            builder = builder.user_data_dir(dir);
        }
        builder.build().map_err(ExportError::Launch)
    }
}

/// Handle for tearing a session down from outside the run flow, used by the
/// cancel path. Teardown through it is best-effort and idempotent with the
/// run's own finalization.
#[derive(Clone)]
pub struct SessionTeardown {
    browser: Arc<AsyncMutex<Browser>>,
    watcher: AbortHandle,
    capture: Option<AbortHandle>,
    download_dir: PathBuf,
}

impl SessionTeardown {
    pub async fn shutdown(self) {
        self.watcher.abort();
        if let Some(capture) = self.capture {
            capture.abort();
        }
        {
            let mut browser = self.browser.lock().await;
            if let Err(err) = browser.close().await {
                warn!(error = %err, "failed to close browser during cancel");
            }
        }
        sweep_temp_profiles(&self.download_dir);
    }
}

/// An exclusively-owned browser automation session: browser process, active
/// page, download capture, directory watcher, and zero or one temporary
/// profile directory.
pub struct BrowserSession {
    browser: Arc<AsyncMutex<Browser>>,
    handler_task: Option<JoinHandle<()>>,
    capture_task: Option<JoinHandle<()>>,
    watcher: DirectoryWatcher,
    page: Page,
    download_rx: UnboundedReceiver<DownloadSignal>,
    download_dir: PathBuf,
    temp_profile: Option<PathBuf>,
    items: Vec<Element>,
    generation: u64,
}

impl BrowserSession {
    pub fn teardown_handle(&self) -> SessionTeardown {
        SessionTeardown {
            browser: Arc::clone(&self.browser),
            watcher: self.watcher.abort_handle(),
            capture: self.capture_task.as_ref().map(|task| task.abort_handle()),
            download_dir: self.download_dir.clone(),
        }
    }

    /// Tears the session down. The browser itself is only closed when
    /// `close_browser` is set; otherwise it is left open for inspection.
    pub async fn close(&mut self, close_browser: bool) {
        self.watcher.stop();
        if let Some(task) = self.capture_task.take() {
            task.abort();
        }
        if close_browser {
            info!("closing browser");
            {
                let mut browser = self.browser.lock().await;
                if let Err(err) = browser.close().await {
                    warn!(error = %err, "failed to close browser gracefully");
                }
            }
            if let Some(task) = self.handler_task.take() {
                if let Err(err) = task.await {
                    warn!(error = %err, "browser handler join error");
                }
            }
        } else {
            info!("keeping browser open for inspection");
        }
        if let Some(profile) = self.temp_profile.take() {
            if let Err(err) = fs::remove_dir_all(&profile) {
                warn!(
                    dir = %profile.display(),
                    error = %err,
                    "failed to remove temporary profile"
                );
            }
        }
        sweep_temp_profiles(&self.download_dir);
    }

    fn stash(&mut self, elements: Vec<Element>) -> Vec<ItemHandle> {
        self.generation += 1;
        self.items = elements;
        (0..self.items.len())
            .map(|slot| ItemHandle::new(slot, self.generation))
            .collect()
    }

    async fn eval_value(&mut self, script: &str) -> ExportResult<serde_json::Value> {
        self.page
            .evaluate(script)
            .await?
            .into_value()
            .map_err(|err| {
                ExportError::Unexpected(format!("failed to decode evaluation result: {err}"))
            })
    }

    async fn probe(&mut self, locator: Locator<'_>) -> ExportResult<bool> {
        match locator.text {
            None => Ok(self.page.find_element(locator.css).await.is_ok()),
            Some(text) => {
                let script = probe_script(locator.css, text);
                Ok(self.eval_value(&script).await?.as_bool().unwrap_or(false))
            }
        }
    }

    async fn click_element(&self, element: &Element, what: &str) -> ExportResult<()> {
        element.click().await.map_err(|err| {
            ExportError::Unexpected(format!("failed to click {what}: {err}"))
        })?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl UiDriver for BrowserSession {
    async fn navigate(&mut self, url: &str) -> ExportResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(ExportError::Configuration)?;
        let bounded = timeout(NAVIGATION_TIMEOUT, async {
            self.page.goto(params).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, ExportError>(())
        })
        .await;
        match bounded {
            Ok(outcome) => outcome,
            Err(_) => Err(ExportError::Navigation {
                url: url.to_string(),
                reason: "timed out".into(),
            }),
        }
    }

    async fn evaluate(&mut self, script: &str) -> ExportResult<serde_json::Value> {
        self.eval_value(script).await
    }

    async fn match_count(&mut self, selector: &str) -> ExportResult<usize> {
        Ok(self.page.find_elements(selector).await?.len())
    }

    async fn capture_items(&mut self, selector: &str) -> ExportResult<Vec<ItemHandle>> {
        let elements = self.page.find_elements(selector).await?;
        Ok(self.stash(elements))
    }

    async fn capture_widened(&mut self, marker: &str) -> ExportResult<Vec<ItemHandle>> {
        let tagged = self
            .eval_value(&widen_script(marker))
            .await?
            .as_u64()
            .unwrap_or(0);
        debug!(marker, tagged, "widened content markers to list rows");
        let elements = self.page.find_elements(TAGGED_ITEM_SELECTOR).await?;
        Ok(self.stash(elements))
    }

    async fn capture_heuristic(&mut self) -> ExportResult<Vec<ItemHandle>> {
        let tagged = self
            .eval_value(HEURISTIC_SCRIPT)
            .await?
            .as_u64()
            .unwrap_or(0);
        debug!(tagged, "tagged visible clickable candidates");
        let elements = self.page.find_elements(TAGGED_ITEM_SELECTOR).await?;
        Ok(self.stash(elements))
    }

    async fn click_item(&mut self, item: ItemHandle) -> ExportResult<()> {
        if item.generation() != self.generation {
            return Err(ExportError::StaleItem);
        }
        let element = self.items.get(item.slot()).ok_or(ExportError::StaleItem)?;
        element.click().await.map_err(|err| {
            ExportError::Unexpected(format!("failed to click recording: {err}"))
        })?;
        Ok(())
    }

    async fn click_first(&mut self, locator: Locator<'_>) -> ExportResult<bool> {
        match locator.text {
            None => match self.page.find_element(locator.css).await {
                Ok(element) => {
                    self.click_element(&element, locator.css).await?;
                    Ok(true)
                }
                Err(_) => Ok(false),
            },
            Some(text) => {
                let script = tag_target_script(locator.css, text);
                if !self.eval_value(&script).await?.as_bool().unwrap_or(false) {
                    return Ok(false);
                }
                match self.page.find_element(TAGGED_TARGET_SELECTOR).await {
                    Ok(element) => {
                        self.click_element(&element, locator.css).await?;
                        Ok(true)
                    }
                    Err(_) => Ok(false),
                }
            }
        }
    }

    async fn wait_for(&mut self, locator: Locator<'_>, timeout_after: Duration) -> ExportResult<bool> {
        let deadline = Instant::now() + timeout_after;
        loop {
            if self.probe(locator).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(SELECTOR_POLL).await;
        }
    }

    async fn wait_for_download(&mut self, timeout_after: Duration) -> ExportResult<bool> {
        // Signals left over from earlier recordings are not this export's.
        while self.download_rx.try_recv().is_ok() {}
        match timeout(timeout_after, self.download_rx.recv()).await {
            Ok(Some(signal)) => {
                debug!(?signal, "download event observed");
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(_) => Ok(false),
        }
    }

    async fn history_back(&mut self) -> ExportResult<()> {
        let history = self.page.execute(GetNavigationHistoryParams::default()).await?;
        let current = history.current_index;
        if current > 0 {
            if let Some(entry) = history.entries.get((current - 1) as usize) {
                self.page
                    .execute(NavigateToHistoryEntryParams::new(entry.id))
                    .await?;
            }
        }
        Ok(())
    }

    async fn reload(&mut self) -> ExportResult<()> {
        self.page.execute(ReloadParams::default()).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }
}

async fn register_download_capture(
    page: &Page,
    download_dir: &Path,
) -> ExportResult<(UnboundedReceiver<DownloadSignal>, JoinHandle<()>)> {
    let behavior = SetDownloadBehaviorParams::builder()
        .behavior(SetDownloadBehaviorBehavior::Allow)
        .download_path(download_dir.to_string_lossy().to_string())
        .build()
        .map_err(ExportError::Configuration)?;
    page.execute(behavior).await?;

    let will_begin = page.event_listener::<EventDownloadWillBegin>().await?;
    let progress = page.event_listener::<EventDownloadProgress>().await?;
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(capture_downloads(
        will_begin,
        progress,
        download_dir.to_path_buf(),
        tx,
    ));
    Ok((rx, task))
}

async fn capture_downloads<B, P>(
    mut will_begin: B,
    mut progress: P,
    dir: PathBuf,
    tx: UnboundedSender<DownloadSignal>,
) where
    B: Stream<Item = Arc<EventDownloadWillBegin>> + Unpin,
    P: Stream<Item = Arc<EventDownloadProgress>> + Unpin,
{
    // guid -> filename the browser will land the file under.
    let mut pending: HashMap<String, String> = HashMap::new();
    loop {
        tokio::select! {
            event = will_begin.next() => {
                let Some(event) = event else { break };
                let suggested = if event.suggested_filename.is_empty() {
                    "recording.mp3".to_string()
                } else {
                    event.suggested_filename.clone()
                };
                info!(file = %suggested, url = %event.url, "download started");
                pending.insert(event.guid.clone(), suggested);
                let _ = tx.send(DownloadSignal::Started);
            }
            event = progress.next() => {
                let Some(event) = event else { break };
                match &event.state {
                    DownloadProgressState::Completed => {
                        if let Some(suggested) = pending.remove(&event.guid) {
                            finalize_download(&dir, &suggested);
                            let _ = tx.send(DownloadSignal::Completed);
                        }
                    }
                    DownloadProgressState::Canceled => {
                        pending.remove(&event.guid);
                    }
                    DownloadProgressState::InProgress => {}
                }
            }
        }
    }
}

/// Removes stale temporary profile directories left by this or prior runs.
/// Best-effort: a profile still locked by a live browser stays behind and is
/// picked up by the next run.
pub(crate) fn sweep_temp_profiles(download_dir: &Path) {
    let entries = match fs::read_dir(download_dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %download_dir.display(), error = %err, "no profiles to sweep");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !path.is_dir() || !name.starts_with(TEMP_PROFILE_PREFIX) {
            continue;
        }
        info!(dir = %path.display(), "cleaning up temporary browser profile");
        if let Err(err) = fs::remove_dir_all(&path) {
            warn!(dir = %path.display(), error = %err, "failed to clean up profile directory");
        }
    }
}

fn host_profile_root() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    // Brave first: it is the common passkey setup among the app's users.
    let candidates = [
        home.join("Library/Application Support/BraveSoftware/Brave-Browser"),
        home.join("Library/Application Support/Google/Chrome"),
        home.join(".config/BraveSoftware/Brave-Browser"),
        home.join(".config/google-chrome"),
    ];
    candidates.into_iter().find(|path| path.exists())
}

fn create_temp_profile_dir(download_dir: &Path) -> ExportResult<PathBuf> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    let name = format!(
        "{TEMP_PROFILE_PREFIX}{}-{}",
        Utc::now().timestamp_millis(),
        suffix
    );
    let dir = download_dir.join(name);
    fs::create_dir_all(&dir)?;
    info!(dir = %dir.display(), "created temporary browser profile");
    Ok(dir)
}

const TAGGED_ITEM_SELECTOR: &str = "[data-plaud-item]";
const TAGGED_TARGET_SELECTOR: &str = "[data-plaud-target]";

fn escape_js(input: &str) -> String {
    input.replace('\\', "\\\\").replace('\'', "\\'")
}

fn widen_script(marker: &str) -> String {
    format!(
        r#"
(() => {{
    document.querySelectorAll('[data-plaud-item]').forEach(node => node.removeAttribute('data-plaud-item'));
    let idx = 0;
    document.querySelectorAll('{marker}').forEach(node => {{
        const row = node.closest('li') || node;
        if (!row.hasAttribute('data-plaud-item')) {{
            row.setAttribute('data-plaud-item', String(idx));
            idx += 1;
        }}
    }});
    return idx;
}})()
"#,
        marker = escape_js(marker)
    )
}

const HEURISTIC_SCRIPT: &str = r#"
(() => {
    document.querySelectorAll('[data-plaud-item]').forEach(node => node.removeAttribute('data-plaud-item'));
    const candidates = document.querySelectorAll('li, div[role="button"], div[class*="item"], div[class*="recording"], div[class*="audio"]');
    let idx = 0;
    candidates.forEach(node => {
        const style = window.getComputedStyle(node);
        const rect = node.getBoundingClientRect();
        const visible = style.display !== 'none' && style.visibility !== 'hidden'
            && rect.width > 0 && rect.height > 0;
        const hasContent = node.textContent.trim() !== '' || node.children.length > 0;
        if (visible && hasContent) {
            node.setAttribute('data-plaud-item', String(idx));
            idx += 1;
        }
    });
    return idx;
})()
"#;

fn probe_script(css: &str, text: &str) -> String {
    format!(
        r#"
(() => {{
    const nodes = document.querySelectorAll('{css}');
    for (const node of nodes) {{
        const label = (node.innerText || node.textContent || '').trim();
        if (label.includes('{text}')) {{
            return true;
        }}
    }}
    return false;
}})()
"#,
        css = escape_js(css),
        text = escape_js(text)
    )
}

fn tag_target_script(css: &str, text: &str) -> String {
    format!(
        r#"
(() => {{
    document.querySelectorAll('[data-plaud-target]').forEach(node => node.removeAttribute('data-plaud-target'));
    const nodes = document.querySelectorAll('{css}');
    for (const node of nodes) {{
        const label = (node.innerText || node.textContent || '').trim();
        if (label.includes('{text}')) {{
            node.setAttribute('data-plaud-target', '1');
            return true;
        }}
    }}
    return false;
}})()
"#,
        css = escape_js(css),
        text = escape_js(text)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_profile_dirs_are_unique_and_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let first = create_temp_profile_dir(dir.path()).unwrap();
        let second = create_temp_profile_dir(dir.path()).unwrap();
        assert_ne!(first, second);
        for profile in [&first, &second] {
            let name = profile.file_name().unwrap().to_str().unwrap();
            assert!(name.starts_with(TEMP_PROFILE_PREFIX));
            assert!(profile.is_dir());
        }
    }

    #[test]
    fn profile_sweep_removes_only_prefixed_directories() {
        let dir = tempfile::tempdir().unwrap();
        let stale = create_temp_profile_dir(dir.path()).unwrap();
        std::fs::write(stale.join("Cookies"), b"stale").unwrap();
        let kept_dir = dir.path().join("keep-me");
        std::fs::create_dir(&kept_dir).unwrap();
        std::fs::write(dir.path().join("recording.mp3"), b"audio").unwrap();

        sweep_temp_profiles(dir.path());

        assert!(!stale.exists());
        assert!(kept_dir.exists());
        assert!(dir.path().join("recording.mp3").exists());
    }

    #[test]
    fn text_scripts_escape_quotes() {
        let script = tag_target_script("div[class*='name']", "I'm Ready");
        assert!(script.contains("div[class*=\\'name\\']"));
        assert!(script.contains("I\\'m Ready"));
    }
}
