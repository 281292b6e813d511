use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Markup that only appears on container (collection) pages. Generic
/// "subscribe to all" buttons are left out since ordinary items with
/// required dependencies render them too.
const CONTAINER_LANDMARKS: &[&str] = &[
    "mainContentsCollection",
    "collectionHeader",
    "SubscribeCollectionBtn",
    "Subscribe to Collection",
];

static ITEM_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sharedfiles/filedetails/\?id=(\d+)").expect("valid item link pattern")
});

pub fn has_container_markup(html: &str) -> bool {
    CONTAINER_LANDMARKS
        .iter()
        .any(|landmark| html.contains(landmark))
}

/// Item ids linked from `html` in first-seen order, excluding `own_id`.
pub fn child_item_ids(html: &str, own_id: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    ITEM_LINK
        .captures_iter(html)
        .filter_map(|captures| captures.get(1))
        .map(|id| id.as_str())
        .filter(|id| *id != own_id && seen.insert(*id))
        .map(str::to_string)
        .collect()
}
