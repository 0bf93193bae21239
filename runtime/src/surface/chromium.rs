// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Chromium-backed content surface using chromiumoxide.
//!
//! Every action is a small JS snippet built from the [`SurfaceProfile`];
//! selector strings are embedded as JSON literals so they never need
//! escaping by hand.

use super::profile::SurfaceProfile;
use super::{ActionOutcome, ContentHandle, ItemExtractor, LoadAffordance, Locator, SurfaceAction};
use crate::error::{HarvestError, SurfaceError};
use crate::item::{Item, SortKey};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. HARVEST_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("HARVEST_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. ~/.harvest/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = if cfg!(target_os = "macos") {
            vec![
                home.join(".harvest/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".harvest/chromium/chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".harvest/chromium/chrome"),
            ]
        } else {
            vec![
                home.join(".harvest/chromium/chrome-linux64/chrome"),
                home.join(".harvest/chromium/chrome"),
            ]
        };
        if let Some(found) = candidates.into_iter().find(|c| c.exists()) {
            return Some(found);
        }
    }

    // 3. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// A launched headless Chromium.
pub struct ChromiumBrowser {
    browser: Browser,
}

impl ChromiumBrowser {
    /// Launch a headless Chromium instance.
    pub async fn launch() -> Result<Self> {
        let chrome_path = find_chromium().ok_or_else(|| {
            HarvestError::BrowserUnavailable(
                "Chromium not found; set HARVEST_CHROMIUM_PATH".to_string(),
            )
        })?;

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--lang=en-US")
            .build()
            .map_err(|e| HarvestError::BrowserUnavailable(format!("bad browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        Ok(Self { browser })
    }

    /// Open `url` in a fresh tab and wrap it as a handle + extractor pair.
    pub async fn open(
        &self,
        url: &str,
        profile: Arc<SurfaceProfile>,
        timeout: Duration,
    ) -> Result<(ChromiumHandle, ChromiumExtractor)> {
        let page = tokio::time::timeout(timeout, self.browser.new_page(url))
            .await
            .map_err(|_| SurfaceError::transient(format!("opening {url} timed out")))?
            .with_context(|| format!("failed to open {url}"))?;
        let _ = page.wait_for_navigation().await;

        let extractor = ChromiumExtractor {
            page: page.clone(),
            profile: Arc::clone(&profile),
        };
        Ok((
            ChromiumHandle {
                page: Some(page),
                profile,
            },
            extractor,
        ))
    }

    pub async fn close(mut self) -> Result<()> {
        self.browser.close().await.context("failed to close browser")?;
        let _ = self.browser.wait().await;
        Ok(())
    }
}

/// One Chromium tab driven as a content surface.
pub struct ChromiumHandle {
    page: Option<Page>,
    profile: Arc<SurfaceProfile>,
}

impl ChromiumHandle {
    fn page(&self) -> Result<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| SurfaceError::permanent("surface already released").into())
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: &str) -> Result<T> {
        let result = self
            .page()?
            .evaluate(script)
            .await
            .context("JS execution failed")?;
        result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert JS result: {e:?}"))
    }

    async fn eval_bool(&self, script: String) -> Result<ActionOutcome> {
        let applied: bool = self.eval(&script).await?;
        Ok(ActionOutcome::Applied(applied))
    }

    fn labels(&self, key: SortKey) -> String {
        js_literal(&self.profile.labels_for(key))
    }

    fn container_expr(&self) -> String {
        match &self.profile.scroll_container_selector {
            Some(sel) => format!(
                "(document.querySelector({}) || document.scrollingElement || document.documentElement)",
                js_literal(sel)
            ),
            None => "(document.scrollingElement || document.documentElement)".to_string(),
        }
    }
}

/// Encode a value as a JS literal.
fn js_literal<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Shared JS helpers prepended to interactive snippets.
const JS_HELPERS: &str = r#"
const sleep = (ms) => new Promise(r => setTimeout(r, ms));
const visible = (el) => !!el && el.getClientRects().length > 0;
const textOf = (el) => ((el && (el.getAttribute('aria-label') || el.textContent)) || '').trim().toLowerCase();
const matches = (el, labels) => { const t = textOf(el); return labels.some(l => t.includes(l)); };
"#;

#[async_trait]
impl ContentHandle for ChromiumHandle {
    async fn current_url(&self) -> Result<String> {
        let url = self
            .page()?
            .url()
            .await
            .context("failed to get URL")?
            .map(|u| u.to_string())
            .unwrap_or_default();
        Ok(url)
    }

    async fn perform(&mut self, action: &SurfaceAction) -> Result<ActionOutcome> {
        let p = &self.profile;
        match action {
            SurfaceAction::ActivateSortControl { key } => {
                self.eval_bool(format!(
                    r#"(async () => {{ {JS_HELPERS}
                        const button = document.querySelector({button});
                        if (visible(button)) {{ button.click(); await sleep(400); }}
                        const labels = {labels};
                        const option = [...document.querySelectorAll({options})]
                            .find(el => visible(el) && matches(el, labels));
                        if (!option) return false;
                        option.click();
                        return true;
                    }})()"#,
                    button = js_literal(&p.sort_button_selector),
                    options = js_literal(&p.sort_option_selector),
                    labels = self.labels(*key),
                ))
                .await
            }
            SurfaceAction::Navigate { url } => {
                let page = self.page()?;
                page.goto(url.as_str())
                    .await
                    .with_context(|| format!("navigation to {url} failed"))?;
                let _ = page.wait_for_navigation().await;
                Ok(ActionOutcome::Applied(true))
            }
            SurfaceAction::KeyboardSort { key } => {
                self.eval_bool(format!(
                    r#"(async () => {{ {JS_HELPERS}
                        const press = (el, key) => ['keydown', 'keyup'].forEach(t =>
                            el.dispatchEvent(new KeyboardEvent(t, {{ key, bubbles: true }})));
                        const button = document.querySelector({button});
                        if (!button) return false;
                        button.focus();
                        press(button, 'Enter');
                        await sleep(400);
                        const labels = {labels};
                        const options = [...document.querySelectorAll({options})];
                        for (const el of options) {{
                            el.focus();
                            press(el, 'ArrowDown');
                            if (matches(el, labels)) {{ press(el, 'Enter'); el.click(); return true; }}
                        }}
                        return false;
                    }})()"#,
                    button = js_literal(&p.sort_button_selector),
                    options = js_literal(&p.sort_option_selector),
                    labels = self.labels(*key),
                ))
                .await
            }
            SurfaceAction::RevealSortControl => {
                self.eval_bool(format!(
                    r#"(async () => {{ {JS_HELPERS}
                        const button = document.querySelector({button});
                        if (!button) return false;
                        button.scrollIntoView({{ block: 'center' }});
                        await sleep(300);
                        return visible(button);
                    }})()"#,
                    button = js_literal(&p.sort_button_selector),
                ))
                .await
            }
            SurfaceAction::ExpandSortMenu => {
                self.eval_bool(format!(
                    r#"(async () => {{ {JS_HELPERS}
                        const triggers = [...document.querySelectorAll("[aria-haspopup], [aria-expanded='false']")]
                            .filter(visible);
                        const trigger = triggers.find(el => textOf(el).includes('sort')) || triggers[0];
                        if (!trigger) return false;
                        trigger.click();
                        await sleep(400);
                        return document.querySelectorAll({options}).length > 0;
                    }})()"#,
                    options = js_literal(&p.sort_option_selector),
                ))
                .await
            }
            SurfaceAction::ScanSortCandidates { key } => {
                self.eval_bool(format!(
                    r#"(async () => {{ {JS_HELPERS}
                        const labels = {labels};
                        const candidates = [...document.querySelectorAll(
                            "button, a, li, [role='button'], [role='option'], [role='menuitem'], [role='menuitemradio'], [role='radio']")]
                            .filter(el => visible(el) && matches(el, labels));
                        for (const el of candidates.slice(0, 8)) {{
                            el.click();
                            await sleep(300);
                            if (el.getAttribute('aria-checked') === 'true' || el.getAttribute('aria-selected') === 'true') return true;
                        }}
                        return candidates.length > 0;
                    }})()"#,
                    labels = self.labels(*key),
                ))
                .await
            }
            SurfaceAction::InspectOrdering { key, sample } => {
                let direction = match key {
                    SortKey::Worst => "asc",
                    SortKey::Best => "desc",
                    SortKey::Recent => "none",
                };
                let verdict: Option<bool> = self
                    .eval(&format!(
                        r#"(() => {{
                            if ({direction:?} === 'none') return null;
                            const items = [...document.querySelectorAll({items})].slice(0, {sample});
                            const ratings = items.map(el => {{
                                const r = el.querySelector({rating});
                                if (!r) return NaN;
                                const raw = {attr} ? (r.getAttribute({attr}) || '') : r.textContent;
                                const m = (raw || '').match(/\d+([.,]\d+)?/);
                                return m ? parseFloat(m[0].replace(',', '.')) : NaN;
                            }}).filter(n => !Number.isNaN(n));
                            if (ratings.length < 2) return null;
                            if (ratings.every(r => r === ratings[0])) return null;
                            const ordered = ratings.every((r, i) => i === 0 ||
                                ({direction:?} === 'asc' ? ratings[i - 1] <= r : ratings[i - 1] >= r));
                            return ordered;
                        }})()"#,
                        items = js_literal(&p.item_selector),
                        rating = js_literal(&p.rating_selector),
                        attr = js_literal(&p.rating_attribute),
                    ))
                    .await?;
                Ok(ActionOutcome::Ordering(verdict))
            }
            SurfaceAction::ProbeLoadMore => {
                #[derive(Deserialize)]
                struct Probe {
                    scrollable: bool,
                    clickable: bool,
                }
                let probe: Probe = self
                    .eval(&format!(
                        r#"(() => {{
                            const c = {container};
                            const button = document.querySelector({more});
                            return {{
                                scrollable: c.scrollHeight > c.clientHeight + 4,
                                clickable: !!button && button.getClientRects().length > 0,
                            }};
                        }})()"#,
                        container = self.container_expr(),
                        more = js_literal(&p.load_more_selector),
                    ))
                    .await?;
                Ok(ActionOutcome::Affordance(LoadAffordance {
                    scrollable: probe.scrollable,
                    clickable: probe.clickable,
                }))
            }
            SurfaceAction::Scroll {
                distance_px,
                repetitions,
                pause,
            } => {
                self.eval_bool(format!(
                    r#"(async () => {{ {JS_HELPERS}
                        const c = {container};
                        const start = c.scrollTop;
                        for (let i = 0; i < {repetitions}; i++) {{
                            c.scrollBy(0, {distance_px});
                            await sleep({pause});
                        }}
                        return c.scrollTop !== start;
                    }})()"#,
                    container = self.container_expr(),
                    pause = pause.as_millis(),
                ))
                .await
            }
            SurfaceAction::ClickLoadMore => {
                self.eval_bool(format!(
                    r#"(() => {{ {JS_HELPERS}
                        const button = document.querySelector({more});
                        if (!visible(button) || button.disabled) return false;
                        button.click();
                        return true;
                    }})()"#,
                    more = js_literal(&p.load_more_selector),
                ))
                .await
            }
            SurfaceAction::ResetScroll => {
                self.eval_bool(format!(
                    "(() => {{ const c = {}; c.scrollTo(0, 0); return true; }})()",
                    self.container_expr()
                ))
                .await
            }
            SurfaceAction::DismissOverlays => {
                self.eval_bool(format!(
                    r#"(() => {{ {JS_HELPERS}
                        let dismissed = false;
                        for (const sel of {overlays}) {{
                            for (const el of document.querySelectorAll(sel)) {{
                                if (visible(el)) {{ el.click(); dismissed = true; }}
                            }}
                        }}
                        document.dispatchEvent(new KeyboardEvent('keydown', {{ key: 'Escape', bubbles: true }}));
                        return dismissed;
                    }})()"#,
                    overlays = js_literal(&p.overlay_selectors),
                ))
                .await
            }
        }
    }

    async fn count(&self, locator: &Locator) -> Result<usize> {
        self.eval(&format!(
            "document.querySelectorAll({}).length",
            js_literal(locator.as_str())
        ))
        .await
    }

    async fn release(&mut self) -> Result<()> {
        if let Some(page) = self.page.take() {
            page.close().await.context("failed to close page")?;
        }
        Ok(())
    }
}

/// Reads items from a Chromium tab.
pub struct ChromiumExtractor {
    page: Page,
    profile: Arc<SurfaceProfile>,
}

#[derive(Deserialize)]
struct RawItem {
    id: Option<String>,
    author: String,
    text: String,
    rating: Option<f32>,
    date: Option<String>,
}

#[async_trait]
impl ItemExtractor for ChromiumExtractor {
    async fn extract(&self) -> Result<Vec<Item>> {
        let p = &self.profile;
        let script = format!(
            r#"(() => {{
                const pick = (root, sel) => {{ const el = sel && root.querySelector(sel); return el ? el.textContent.trim() : null; }};
                return [...document.querySelectorAll({items})].map(el => {{
                    const r = el.querySelector({rating});
                    const raw = r ? ({attr} ? (r.getAttribute({attr}) || '') : r.textContent) : '';
                    const m = (raw || '').match(/\d+([.,]\d+)?/);
                    return {{
                        id: {id_attr} ? el.getAttribute({id_attr}) : null,
                        author: pick(el, {author}) || '',
                        text: pick(el, {text}) || '',
                        rating: m ? parseFloat(m[0].replace(',', '.')) : null,
                        date: pick(el, {date}),
                    }};
                }});
            }})()"#,
            items = js_literal(&p.item_selector),
            rating = js_literal(&p.rating_selector),
            attr = js_literal(&p.rating_attribute),
            id_attr = js_literal(&p.id_attribute),
            author = js_literal(&p.author_selector),
            text = js_literal(&p.text_selector),
            date = js_literal(&p.date_selector),
        );

        let raw: Vec<RawItem> = self
            .page
            .evaluate(script.as_str())
            .await
            .context("item extraction failed")?
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert extracted items: {e:?}"))?;

        Ok(raw
            .into_iter()
            .filter(|r| !r.author.is_empty() || !r.text.is_empty())
            .map(|r| Item {
                source_id: r.id,
                author: r.author,
                text: r.text,
                rating: r.rating,
                date: r.date,
                phase: None,
            })
            .collect())
    }

    fn item_locator(&self) -> Locator {
        Locator::new(self.profile.item_selector.clone())
    }
}
