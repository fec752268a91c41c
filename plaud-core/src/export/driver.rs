use std::time::Duration;

use async_trait::async_trait;

use super::error::ExportResult;

/// Opaque reference to one discovered recording row.
///
/// Handles are only valid until the next capture refreshes the list; the
/// generation stamp lets the driver reject stale ones instead of clicking a
/// detached DOM node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHandle {
    slot: usize,
    generation: u64,
}

impl ItemHandle {
    pub fn new(slot: usize, generation: u64) -> Self {
        Self { slot, generation }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// A CSS selector, optionally constrained to elements whose text contains a
/// needle. The target UI mostly distinguishes controls by label rather than
/// by stable class names, and text matching has no CSS equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator<'a> {
    pub css: &'a str,
    pub text: Option<&'a str>,
}

impl<'a> Locator<'a> {
    pub const fn css(css: &'a str) -> Self {
        Self { css, text: None }
    }

    pub const fn with_text(css: &'a str, text: &'a str) -> Self {
        Self {
            css,
            text: Some(text),
        }
    }
}

/// The page operations the export engine needs from a browser.
///
/// `BrowserSession` implements this over CDP; tests drive the engine with
/// scripted implementations instead of a live Chromium.
#[async_trait(?Send)]
pub trait UiDriver {
    async fn navigate(&mut self, url: &str) -> ExportResult<()>;

    /// Runs a script in the page and returns its JSON value.
    async fn evaluate(&mut self, script: &str) -> ExportResult<serde_json::Value>;

    /// How many elements currently match `selector`.
    async fn match_count(&mut self, selector: &str) -> ExportResult<usize>;

    /// Captures the current matches of `selector` as a fresh set of item
    /// handles, invalidating all previously captured handles.
    async fn capture_items(&mut self, selector: &str) -> ExportResult<Vec<ItemHandle>>;

    /// Like [`capture_items`](Self::capture_items), but widens each match to
    /// its nearest enclosing list-item ancestor (the match itself when none
    /// exists). Used for content markers that decorate a clickable row.
    async fn capture_widened(&mut self, marker: &str) -> ExportResult<Vec<ItemHandle>>;

    /// Last-resort capture: visible, interactive-looking elements that carry
    /// text or children. Intentionally permissive.
    async fn capture_heuristic(&mut self) -> ExportResult<Vec<ItemHandle>>;

    async fn click_item(&mut self, item: ItemHandle) -> ExportResult<()>;

    /// Clicks the first element matching `locator`. Returns `false` when
    /// nothing matches; errors are reserved for transport failures.
    async fn click_first(&mut self, locator: Locator<'_>) -> ExportResult<bool>;

    /// Waits for `locator` to match, bounded by `timeout`. Returns whether
    /// it appeared in time.
    async fn wait_for(&mut self, locator: Locator<'_>, timeout: Duration) -> ExportResult<bool>;

    /// Waits for the next download event, bounded by `timeout`. Returns
    /// whether one was observed.
    async fn wait_for_download(&mut self, timeout: Duration) -> ExportResult<bool>;

    async fn history_back(&mut self) -> ExportResult<()>;

    /// Full reload, resolved once the DOM content has loaded.
    async fn reload(&mut self) -> ExportResult<()>;
}
