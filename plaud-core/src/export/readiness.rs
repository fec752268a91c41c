use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use super::discovery::gate_sees_recordings;
use super::driver::UiDriver;
use super::error::{ExportError, ExportResult};
use super::progress::{ProgressSink, RunStatus, StatusUpdate};
use super::runner::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const SETTLE_DELAY: Duration = Duration::from_secs(1);
const MAX_ATTEMPTS: u32 = 300;
const STATUS_EVERY: u32 = 5;

/// Injected on top of the page so the operator can signal readiness when the
/// list never becomes automatically detectable (unusual folder layouts,
/// localized UIs).
const READY_OVERLAY_SCRIPT: &str = r#"
(() => {
    if (document.getElementById('plaud-export-ready-dialog')) {
        return true;
    }
    window.__plaudExportReady = false;
    const dialog = document.createElement('div');
    dialog.id = 'plaud-export-ready-dialog';
    dialog.style.cssText = [
        'position: fixed', 'top: 20px', 'right: 20px',
        'background-color: #4a6fa5', 'color: white', 'padding: 15px',
        'border-radius: 5px', 'z-index: 9999',
        'box-shadow: 0 2px 10px rgba(0,0,0,0.2)', 'max-width: 300px'
    ].join(';');
    dialog.innerHTML = `
        <h3 style="margin-top: 0; margin-bottom: 10px;">Plaud Audio Export</h3>
        <p style="margin-bottom: 10px;">Please navigate to your recordings page, then click the button below:</p>
        <button id="plaud-export-ready-button" style="background-color: white; color: #4a6fa5; border: none; padding: 8px 15px; border-radius: 3px; cursor: pointer; font-weight: bold;">I'm Ready</button>
    `;
    document.body.appendChild(dialog);
    document.getElementById('plaud-export-ready-button').addEventListener('click', () => {
        window.__plaudExportReady = true;
        dialog.style.display = 'none';
    });
    return true;
})()
"#;

const USER_READY_SCRIPT: &str = "window.__plaudExportReady === true";

const REMOVE_OVERLAY_SCRIPT: &str = r#"
(() => {
    const dialog = document.getElementById('plaud-export-ready-dialog');
    if (dialog) {
        dialog.remove();
    }
    return true;
})()
"#;

/// Blocks until the recordings list is detectable or the operator clicks the
/// injected acknowledgement button, bounded by five minutes.
///
/// An operator acknowledgement is trusted even when no recordings were ever
/// detected; the subsequent discovery step reports an empty list as its own
/// distinguishable outcome.
pub async fn wait_for_recordings<D: UiDriver + ?Sized>(
    driver: &mut D,
    cancel: &CancelToken,
    sink: &dyn ProgressSink,
) -> ExportResult<()> {
    driver.evaluate(READY_OVERLAY_SCRIPT).await?;

    let mut user_ready = false;
    for attempt in 1..=MAX_ATTEMPTS {
        if cancel.is_canceled() {
            return Err(ExportError::Canceled);
        }

        user_ready = is_user_ready(driver).await?;
        if user_ready {
            info!("operator signaled readiness");
            // Give any in-flight page transition a moment to finish.
            sleep(SETTLE_DELAY).await;
            break;
        }

        if let Some(selector) = gate_sees_recordings(driver).await? {
            info!(selector, "recordings detected");
            driver.evaluate(REMOVE_OVERLAY_SCRIPT).await?;
            return Ok(());
        }

        if attempt % STATUS_EVERY == 0 {
            debug!(attempt, max = MAX_ATTEMPTS, "still waiting for recordings");
            sink.publish(StatusUpdate::new(
                RunStatus::WaitingRecordings,
                "Waiting for recordings to appear or for you to click \"I'm Ready\"...",
            ));
        }

        sleep(POLL_INTERVAL).await;
    }

    if gate_sees_recordings(driver).await?.is_some() {
        return Ok(());
    }
    if user_ready {
        info!("proceeding on operator readiness signal");
        return Ok(());
    }
    Err(ExportError::Timeout("recordings to appear".into()))
}

async fn is_user_ready<D: UiDriver + ?Sized>(driver: &mut D) -> ExportResult<bool> {
    let value = driver.evaluate(USER_READY_SCRIPT).await?;
    Ok(value.as_bool().unwrap_or(false))
}
