use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Suffixes Chromium parks in-flight downloads under.
const PARTIAL_SUFFIXES: [&str; 2] = [".crdownload", ".tmp"];

fn uuid_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("valid regex")
    })
}

fn canonical_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

pub fn generated_recording_name(now: DateTime<Utc>) -> String {
    format!("plaud-recording-{}.mp3", canonical_timestamp(now))
}

/// Maps an observed filename to its canonical `.mp3` form.
///
/// Returns `None` when the name is already canonical, which makes every
/// caller (download listener, directory watcher, post-run sweep) idempotent.
/// UUID-shaped and extensionless names are replaced entirely; any other
/// extension is stripped and `.mp3` appended.
pub fn normalized_filename(name: &str, now: DateTime<Utc>) -> Option<String> {
    if name.to_lowercase().ends_with(".mp3") {
        return None;
    }
    if uuid_name_pattern().is_match(name) || !name.contains('.') {
        return Some(generated_recording_name(now));
    }
    let base = match name.rfind('.') {
        Some(idx) => &name[..idx],
        None => name,
    };
    Some(format!("{base}.mp3"))
}

/// Renames `path` to its normalized sibling, if it needs one.
///
/// A source that vanished between observation and rename was already handled
/// by one of the other correction paths and is not an error.
pub(crate) fn normalize_in_place(
    path: &Path,
    now: DateTime<Utc>,
) -> io::Result<Option<PathBuf>> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    let Some(normalized) = normalized_filename(name, now) else {
        return Ok(None);
    };
    let target = match path.parent() {
        Some(parent) => parent.join(&normalized),
        None => PathBuf::from(&normalized),
    };
    match fs::rename(path, &target) {
        Ok(()) => Ok(Some(target)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Post-run pass over the top level of the download directory: any remaining
/// non-`.mp3` file gets the same normalization the live paths apply.
/// Subdirectories (including temporary browser profiles) are skipped.
/// Returns the number of files renamed; failures are logged, never raised.
pub fn sweep_directory(dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "failed to scan download directory");
            return 0;
        }
    };

    let mut renamed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match normalize_in_place(&path, Utc::now()) {
            Ok(Some(target)) => {
                info!(
                    from = %path.display(),
                    to = %target.display(),
                    "renamed file without .mp3 extension"
                );
                renamed += 1;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(file = %path.display(), error = %err, "failed to rename file during sweep");
            }
        }
    }
    renamed
}

/// Moves a completed download to its normalized name, falling back to the
/// host's default downloads folder once if the primary rename fails.
pub(crate) fn finalize_download(dir: &Path, suggested: &str) {
    let landed = dir.join(suggested);
    let Some(normalized) = normalized_filename(suggested, Utc::now()) else {
        info!(file = %landed.display(), "download completed");
        return;
    };
    match fs::rename(&landed, dir.join(&normalized)) {
        Ok(()) => info!(from = %suggested, to = %normalized, "download saved"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(file = %suggested, "download already normalized by another path");
        }
        Err(err) => {
            warn!(
                file = %landed.display(),
                error = %err,
                "failed to save download to export directory, trying fallback"
            );
            let Some(fallback_dir) = dirs::download_dir() else {
                warn!("no fallback downloads folder available on this host");
                return;
            };
            if let Err(err) = fs::rename(&landed, fallback_dir.join(&normalized)) {
                warn!(error = %err, "failed to save download to fallback location");
            }
        }
    }
}

/// Safety net for downloads whose completion is observed as a filesystem
/// change rather than a captured browser event: a per-run poller over the
/// download directory renaming anything that lands without a `.mp3` suffix.
#[derive(Debug)]
pub struct DirectoryWatcher {
    task: JoinHandle<()>,
}

impl DirectoryWatcher {
    pub fn spawn(dir: PathBuf) -> Self {
        debug!(dir = %dir.display(), "starting download directory watcher");
        let task = tokio::spawn(watch_directory(dir));
        Self { task }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

async fn watch_directory(dir: PathBuf) {
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        scan_once(&dir);
    }
}

fn scan_once(dir: &Path) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "watcher failed to scan directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let lower = name.to_lowercase();
        if PARTIAL_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix)) {
            continue;
        }
        match normalize_in_place(&path, Utc::now()) {
            Ok(Some(target)) => {
                info!(from = %name, to = %target.display(), "watcher renamed landed download");
            }
            Ok(None) => {}
            Err(err) => {
                warn!(file = %name, error = %err, "watcher failed to rename file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
    }

    #[test]
    fn canonical_mp3_names_are_left_alone() {
        assert_eq!(normalized_filename("meeting.mp3", fixed_now()), None);
        assert_eq!(normalized_filename("MEETING.MP3", fixed_now()), None);
    }

    #[test]
    fn normalization_is_idempotent() {
        let first = normalized_filename("recording.wav", fixed_now()).unwrap();
        assert_eq!(normalized_filename(&first, fixed_now()), None);
    }

    #[test]
    fn uuid_names_never_survive() {
        let name = "a1b2c3d4-e5f6-7890-abcd-ef1234567890";
        let normalized = normalized_filename(name, fixed_now()).unwrap();
        assert!(normalized.starts_with("plaud-recording-"));
        assert!(normalized.ends_with(".mp3"));
        assert!(!normalized.contains(name));

        // Case-insensitive, like the pattern the site actually produces.
        let upper = "A1B2C3D4-E5F6-7890-ABCD-EF1234567890";
        assert!(normalized_filename(upper, fixed_now())
            .unwrap()
            .starts_with("plaud-recording-"));
    }

    #[test]
    fn extensionless_names_get_a_generated_name() {
        let normalized = normalized_filename("somedownload", fixed_now()).unwrap();
        assert!(normalized.starts_with("plaud-recording-"));
        assert!(normalized.ends_with(".mp3"));
    }

    #[test]
    fn foreign_extensions_are_swapped_for_mp3() {
        assert_eq!(
            normalized_filename("recording.wav", fixed_now()).unwrap(),
            "recording.mp3"
        );
        assert_eq!(
            normalized_filename("notes.final.txt", fixed_now()).unwrap(),
            "notes.final.mp3"
        );
    }

    #[test]
    fn generated_names_carry_no_separator_characters() {
        let name = generated_recording_name(fixed_now());
        assert!(!name.contains(':'));
        assert_eq!(name.matches('.').count(), 1, "only the .mp3 dot survives");
    }

    #[test]
    fn normalize_in_place_tolerates_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let ghost = dir.path().join("vanished");
        assert_eq!(normalize_in_place(&ghost, fixed_now()).unwrap(), None);
    }

    #[test]
    fn sweep_renames_uuid_file_and_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let uuid_file = dir.path().join("a1b2c3d4-e5f6-7890-abcd-ef1234567890");
        fs::write(&uuid_file, b"audio").unwrap();
        fs::write(dir.path().join("kept.mp3"), b"audio").unwrap();
        fs::create_dir(dir.path().join("temp-browser-profile-123-abc")).unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        fs::write(dir.path().join("subdir").join("inner.wav"), b"audio").unwrap();

        let renamed = sweep_directory(dir.path());
        assert_eq!(renamed, 1);
        assert!(!uuid_file.exists(), "original UUID path must be gone");

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.starts_with("plaud-recording-")));
        assert!(names.iter().all(|n| n.to_lowercase().ends_with(".mp3")));
        // Nested content is out of scope for the sweep.
        assert!(dir.path().join("subdir").join("inner.wav").exists());
    }

    #[test]
    fn sweep_of_missing_directory_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("never-created");
        assert_eq!(sweep_directory(&gone), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_renames_files_that_land_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = DirectoryWatcher::spawn(dir.path().to_path_buf());

        fs::write(dir.path().join("fresh.wav"), b"audio").unwrap();
        fs::write(dir.path().join("partial.crdownload"), b"half").unwrap();

        // Give the poller a few ticks.
        for _ in 0..4 {
            tokio::time::sleep(WATCH_INTERVAL).await;
            tokio::task::yield_now().await;
        }

        assert!(dir.path().join("fresh.mp3").exists());
        assert!(
            dir.path().join("partial.crdownload").exists(),
            "in-flight downloads must not be touched"
        );
        watcher.stop();
    }
}
