use tokio::time::sleep;
use tracing::{debug, warn};

use super::driver::{Locator, UiDriver};
use super::error::ExportResult;
use crate::config::ExportSettings;

/// One step of the click-through export sequence: a primary selector plus the
/// alternatives tried when the UI has drifted away from the observed shape.
struct StepSpec {
    label: &'static str,
    primary: Locator<'static>,
    alternates: &'static [Locator<'static>],
}

/// The four-step sequence the target UI requires per recording:
/// open the share menu, pick "Export Audio", pick the MP3 format, confirm.
const STEPS: [StepSpec; 4] = [
    StepSpec {
        label: "share menu",
        primary: Locator::css(".iconfont.myIcon.icon-icon_share"),
        alternates: &[
            Locator::css(".icon-icon_share"),
            Locator::css(".icon-share"),
            Locator::css("[class*=\"share\"]"),
            Locator::with_text("button", "Share"),
            Locator::with_text("[role=\"button\"]", "Share"),
        ],
    },
    StepSpec {
        label: "export audio action",
        primary: Locator::with_text("div.name", "Export Audio"),
        alternates: &[
            Locator::with_text("div", "Export Audio"),
            Locator::with_text("[class*=\"name\"]", "Export Audio"),
            Locator::with_text("div", "Export"),
            Locator::with_text("button", "Export Audio"),
            Locator::with_text("[role=\"button\"]", "Export Audio"),
        ],
    },
    StepSpec {
        label: "mp3 format option",
        primary: Locator::with_text("div.name", "MP3"),
        alternates: &[
            Locator::with_text("div", "MP3"),
            Locator::with_text("[class*=\"name\"]", "MP3"),
            Locator::with_text("button", "MP3"),
            Locator::with_text("[role=\"button\"]", "MP3"),
            Locator::with_text(".format-option", "MP3"),
        ],
    },
    StepSpec {
        label: "export confirmation",
        primary: Locator::with_text("div.commonBtn", "Export"),
        alternates: &[
            Locator::css(".commonBtn"),
            Locator::with_text("div", "Export"),
            Locator::with_text("button", "Export"),
            Locator::with_text("[role=\"button\"]", "Export"),
            Locator::with_text(".btn", "Export"),
            Locator::with_text("[class*=\"button\"]", "Export"),
        ],
    },
];

/// Drives the export sequence for the currently selected recording.
///
/// Returns whether all four steps completed. A download that has not started
/// by the end of the race window still counts as success; slow downloads are
/// reconciled by the watcher and the post-run sweep. Nothing thrown by a
/// selector miss escapes to the caller.
pub async fn run_export_workflow<D: UiDriver + ?Sized>(
    driver: &mut D,
    settings: &ExportSettings,
) -> bool {
    match drive_steps(driver, settings).await {
        Ok(completed) => completed,
        Err(err) => {
            warn!(error = %err, "export workflow aborted");
            false
        }
    }
}

async fn drive_steps<D: UiDriver + ?Sized>(
    driver: &mut D,
    settings: &ExportSettings,
) -> ExportResult<bool> {
    let delay = settings.delay();

    for (idx, step) in STEPS.iter().enumerate() {
        if !click_step(driver, step).await? {
            warn!(step = step.label, "no selector matched, giving up on this recording");
            return Ok(false);
        }
        if let Some(next) = STEPS.get(idx + 1) {
            if !driver.wait_for(next.primary, delay).await? {
                // The control may still render late; pause and let the next
                // step's own fallback chain decide.
                debug!(step = next.label, "control not seen in time, continuing optimistically");
                sleep(delay / 2).await;
            }
        }
    }

    let observed = driver.wait_for_download(delay * 3).await?;
    debug!(observed, "download race settled");
    // Let in-flight UI and download state settle before the next recording.
    sleep(delay).await;
    Ok(true)
}

async fn click_step<D: UiDriver + ?Sized>(driver: &mut D, step: &StepSpec) -> ExportResult<bool> {
    if driver.click_first(step.primary).await? {
        debug!(step = step.label, "clicked primary control");
        return Ok(true);
    }
    for alternate in step.alternates {
        if driver.click_first(*alternate).await? {
            debug!(step = step.label, css = alternate.css, "clicked alternate control");
            return Ok(true);
        }
    }
    Ok(false)
}
