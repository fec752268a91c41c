use tracing::{debug, warn};

use super::driver::{ItemHandle, UiDriver};
use super::error::ExportResult;

/// One strategy for locating recording rows. Queries are tried in order and
/// the first one with matches wins; content markers are widened to the row
/// they decorate.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ItemQuery {
    pub selector: &'static str,
    pub widen_to_list_item: bool,
}

const fn query(selector: &'static str) -> ItemQuery {
    ItemQuery {
        selector,
        widen_to_list_item: false,
    }
}

/// Ordered most-specific first, matching the DOM shapes observed in the
/// target application. None of this is a stable contract, hence the depth of
/// the fallback chain.
pub(crate) const STRUCTURAL_QUERIES: &[ItemQuery] = &[
    query("li[draggable=\"true\"]"),
    query(".vue-recycle-scroller__item-view li"),
    ItemQuery {
        selector: ".fileInfo",
        widen_to_list_item: true,
    },
    query(".recording-item"),
    query(".audio-item"),
    query(".file-item"),
    query(".item-container"),
    query("li.item"),
    query("div[role=\"listitem\"]"),
    query(".list-item"),
];

/// The subset the readiness gate polls while waiting for the list to render.
pub(crate) const GATE_QUERIES: &[&str] = &[
    "li[draggable=\"true\"]",
    ".vue-recycle-scroller__item-view li",
    ".fileInfo",
];

/// Markers used to decide whether the page still shows the recordings list.
/// More than one match is required: a detail view can contain a single
/// look-alike element.
pub(crate) const LIST_MARKERS: &[&str] = &[
    ".vue-recycle-scroller__item-view",
    "li[draggable=\"true\"]",
    ".fileInfo",
];

/// Locates the current set of exportable recordings.
///
/// Never errors: any failure degrades to an empty result with a logged
/// cause, and the caller decides whether an empty list is fatal.
pub async fn find_recordings<D: UiDriver + ?Sized>(driver: &mut D) -> Vec<ItemHandle> {
    match try_find(driver).await {
        Ok(items) => items,
        Err(err) => {
            warn!(error = %err, "recording discovery failed");
            Vec::new()
        }
    }
}

async fn try_find<D: UiDriver + ?Sized>(driver: &mut D) -> ExportResult<Vec<ItemHandle>> {
    for query in STRUCTURAL_QUERIES {
        let count = driver.match_count(query.selector).await?;
        if count == 0 {
            continue;
        }
        debug!(selector = query.selector, count, "recordings matched");
        let items = if query.widen_to_list_item {
            driver.capture_widened(query.selector).await?
        } else {
            driver.capture_items(query.selector).await?
        };
        if !items.is_empty() {
            return Ok(items);
        }
    }

    debug!("no structural query matched, trying visible clickable elements");
    let items = driver.capture_heuristic().await?;
    if items.is_empty() {
        warn!("no recordings found with any selector");
    } else {
        debug!(count = items.len(), "heuristic pass found candidate rows");
    }
    Ok(items)
}

/// Read-only existence check used by the readiness gate: does any gate query
/// currently match at least one element?
pub(crate) async fn gate_sees_recordings<D: UiDriver + ?Sized>(
    driver: &mut D,
) -> ExportResult<Option<&'static str>> {
    for selector in GATE_QUERIES {
        if driver.match_count(selector).await? > 0 {
            return Ok(Some(selector));
        }
    }
    Ok(None)
}

/// Whether the page still shows the recordings list. Errors degrade to
/// `false` so a flaky check routes through recovery instead of aborting.
pub(crate) async fn on_recordings_list<D: UiDriver + ?Sized>(driver: &mut D) -> bool {
    for selector in LIST_MARKERS {
        match driver.match_count(selector).await {
            Ok(count) if count > 1 => return true,
            Ok(_) => {}
            Err(err) => {
                warn!(selector, error = %err, "list presence check failed");
                return false;
            }
        }
    }
    false
}
