// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Declarative description of where things live on a particular surface.
//!
//! Selector and label heuristics stay in this document so the engine itself
//! carries no locale or layout knowledge.

use crate::error::HarvestError;
use crate::item::SortKey;
use crate::sort::AddressHint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SurfaceProfile {
    /// One element per collected item.
    pub item_selector: String,
    pub author_selector: String,
    pub text_selector: String,
    pub rating_selector: String,
    /// Read the rating from this attribute instead of the text content.
    pub rating_attribute: Option<String>,
    pub date_selector: Option<String>,
    /// Attribute on the item element holding a stable id.
    pub id_attribute: Option<String>,
    /// Button that opens the ordering menu.
    pub sort_button_selector: String,
    /// Entries inside the ordering menu.
    pub sort_option_selector: String,
    /// Lowercase label fragments identifying each ordering option.
    pub sort_labels: BTreeMap<SortKey, Vec<String>>,
    pub load_more_selector: String,
    /// Scrollable element holding the items; the document when absent.
    pub scroll_container_selector: Option<String>,
    /// Consent banners, dialogs and popups to dismiss during recovery.
    pub overlay_selectors: Vec<String>,
    /// Query-parameter hint for address-level reordering.
    pub address_hint: AddressHint,
}

impl Default for SurfaceProfile {
    fn default() -> Self {
        let mut sort_labels = BTreeMap::new();
        sort_labels.insert(
            SortKey::Recent,
            vec!["newest".into(), "most recent".into(), "recent".into()],
        );
        sort_labels.insert(
            SortKey::Worst,
            vec!["lowest".into(), "lowest rating".into(), "worst".into()],
        );
        sort_labels.insert(
            SortKey::Best,
            vec!["highest".into(), "highest rating".into(), "best".into()],
        );

        Self {
            item_selector: "[data-review-id]".into(),
            author_selector: "[data-review-author]".into(),
            text_selector: "[data-review-text]".into(),
            rating_selector: "[data-review-rating]".into(),
            rating_attribute: Some("aria-label".into()),
            date_selector: Some("[data-review-date]".into()),
            id_attribute: Some("data-review-id".into()),
            sort_button_selector: "button[aria-label*='Sort' i]".into(),
            sort_option_selector: "[role='menuitemradio'], [role='option'], [role='menuitem']"
                .into(),
            sort_labels,
            load_more_selector: "button[aria-label*='more' i]".into(),
            scroll_container_selector: None,
            overlay_selectors: vec![
                "[role='dialog'] button[aria-label*='close' i]".into(),
                "#onetrust-accept-btn-handler".into(),
            ],
            address_hint: AddressHint::default(),
        }
    }
}

impl SurfaceProfile {
    /// Load a profile from a JSON document; missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self, HarvestError> {
        let raw = std::fs::read_to_string(path).map_err(|source| HarvestError::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| HarvestError::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn labels_for(&self, key: SortKey) -> &[String] {
        self.sort_labels
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_profile_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"itemSelector": ".review", "sortLabels": {{"worst": ["tiefste"]}}}}"#
        )
        .unwrap();

        let profile = SurfaceProfile::from_file(file.path()).unwrap();
        assert_eq!(profile.item_selector, ".review");
        assert_eq!(profile.labels_for(SortKey::Worst), ["tiefste".to_string()]);
        assert!(profile.labels_for(SortKey::Best).is_empty());
        assert_eq!(profile.text_selector, "[data-review-text]");
    }

    #[test]
    fn test_missing_profile_is_io_error() {
        let err = SurfaceProfile::from_file(Path::new("/nonexistent/profile.json")).unwrap_err();
        assert!(matches!(err, HarvestError::ConfigIo { .. }));
    }
}
