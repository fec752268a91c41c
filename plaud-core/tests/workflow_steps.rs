use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use plaud_core::{
    run_export_workflow, ExportResult, ExportSettings, ItemHandle, Locator, UiDriver,
};

/// Page stub where only an explicit set of controls exists. Records every
/// selector attempt so tests can assert the fallback order.
#[derive(Default)]
struct ScriptedDriver {
    available: HashSet<String>,
    attempts: Vec<String>,
    clicked: Vec<String>,
    wait_succeeds: bool,
    download_observed: bool,
}

fn key(locator: &Locator<'_>) -> String {
    match locator.text {
        Some(text) => format!("{}|{text}", locator.css),
        None => locator.css.to_string(),
    }
}

impl ScriptedDriver {
    fn with_controls(controls: &[&str]) -> Self {
        Self {
            available: controls.iter().map(|c| c.to_string()).collect(),
            wait_succeeds: true,
            download_observed: true,
            ..Self::default()
        }
    }
}

#[async_trait(?Send)]
impl UiDriver for ScriptedDriver {
    async fn navigate(&mut self, _url: &str) -> ExportResult<()> {
        Ok(())
    }

    async fn evaluate(&mut self, _script: &str) -> ExportResult<Value> {
        Ok(Value::Null)
    }

    async fn match_count(&mut self, _selector: &str) -> ExportResult<usize> {
        Ok(0)
    }

    async fn capture_items(&mut self, _selector: &str) -> ExportResult<Vec<ItemHandle>> {
        Ok(Vec::new())
    }

    async fn capture_widened(&mut self, _marker: &str) -> ExportResult<Vec<ItemHandle>> {
        Ok(Vec::new())
    }

    async fn capture_heuristic(&mut self) -> ExportResult<Vec<ItemHandle>> {
        Ok(Vec::new())
    }

    async fn click_item(&mut self, _item: ItemHandle) -> ExportResult<()> {
        Ok(())
    }

    async fn click_first(&mut self, locator: Locator<'_>) -> ExportResult<bool> {
        let key = key(&locator);
        self.attempts.push(key.clone());
        if self.available.contains(&key) {
            self.clicked.push(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn wait_for(&mut self, _locator: Locator<'_>, _timeout: Duration) -> ExportResult<bool> {
        Ok(self.wait_succeeds)
    }

    async fn wait_for_download(&mut self, _timeout: Duration) -> ExportResult<bool> {
        Ok(self.download_observed)
    }

    async fn history_back(&mut self) -> ExportResult<()> {
        Ok(())
    }

    async fn reload(&mut self) -> ExportResult<()> {
        Ok(())
    }
}

const PRIMARIES: [&str; 4] = [
    ".iconfont.myIcon.icon-icon_share",
    "div.name|Export Audio",
    "div.name|MP3",
    "div.commonBtn|Export",
];

fn settings() -> ExportSettings {
    ExportSettings {
        delay_ms: 100,
        ..ExportSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn all_primary_controls_complete_the_sequence() {
    let mut driver = ScriptedDriver::with_controls(&PRIMARIES);

    assert!(run_export_workflow(&mut driver, &settings()).await);
    assert_eq!(driver.clicked, PRIMARIES.to_vec());
}

#[tokio::test(start_paused = true)]
async fn share_control_falls_back_through_alternates() {
    let mut driver = ScriptedDriver::with_controls(&[
        "[class*=\"share\"]",
        PRIMARIES[1],
        PRIMARIES[2],
        PRIMARIES[3],
    ]);

    assert!(run_export_workflow(&mut driver, &settings()).await);
    assert_eq!(driver.clicked[0], "[class*=\"share\"]");
    // Alternates are tried in declared order until one matches.
    assert_eq!(
        &driver.attempts[..4],
        &[
            ".iconfont.myIcon.icon-icon_share",
            ".icon-icon_share",
            ".icon-share",
            "[class*=\"share\"]",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn missing_export_action_fails_without_reaching_later_steps() {
    let mut driver = ScriptedDriver::with_controls(&[PRIMARIES[0]]);

    assert!(!run_export_workflow(&mut driver, &settings()).await);
    assert!(driver.attempts.iter().any(|a| a.ends_with("|Export Audio")));
    assert!(
        !driver.attempts.iter().any(|a| a.ends_with("|MP3")),
        "format step must not be probed after the action step failed"
    );
}

#[tokio::test(start_paused = true)]
async fn slow_transitions_continue_optimistically() {
    let mut driver = ScriptedDriver::with_controls(&PRIMARIES);
    driver.wait_succeeds = false;

    assert!(run_export_workflow(&mut driver, &settings()).await);
}

#[tokio::test(start_paused = true)]
async fn unobserved_download_still_counts_as_completed() {
    let mut driver = ScriptedDriver::with_controls(&PRIMARIES);
    driver.download_observed = false;

    assert!(run_export_workflow(&mut driver, &settings()).await);
}
