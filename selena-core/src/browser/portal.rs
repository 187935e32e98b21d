use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::config::SelectorSection;
use crate::workflow::{Identifier, WorkflowError, WorkflowResult};

use super::error::BrowserError;
use super::session::SessionPage;

const MATCH_ATTR: &str = "data-selena-match";
const ACTION_ATTR: &str = "data-selena-action";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOutcome {
    pub results: usize,
    pub exact_matches: usize,
}

/// Semantic capability surface of the registry site. The state machine only
/// ever talks to this; selectors and button labels live behind it, so markup
/// drift touches one translation layer.
#[async_trait(?Send)]
pub trait RegistryPortal {
    async fn search(&self, identifier: &Identifier) -> WorkflowResult<SearchOutcome>;
    async fn open_organization(&self, identifier: &Identifier) -> WorkflowResult<()>;
    async fn open_download_dialog(&self) -> WorkflowResult<()>;
    /// Points the browser's download sink at the (identifier, year)
    /// destination directory, creating it if needed.
    async fn prepare_download(&self, dir: &Path) -> WorkflowResult<()>;
    async fn select_year(&self, year: u16) -> WorkflowResult<()>;
    async fn select_all_items(&self) -> WorkflowResult<()>;
    async fn request_archive(&self) -> WorkflowResult<()>;
    async fn captcha_present(&self) -> WorkflowResult<bool>;
}

/// Drives the bo.nalog.gov.ru disclosure portal through a live page.
pub struct BfoPortal {
    page: SessionPage,
    step_delay_ms: [u64; 2],
}

#[derive(Debug, Deserialize)]
struct SearchCounts {
    rows: usize,
    matches: usize,
}

impl BfoPortal {
    pub fn new(page: SessionPage, step_delay_ms: [u64; 2]) -> Self {
        Self {
            page,
            step_delay_ms,
        }
    }

    fn selectors(&self) -> &SelectorSection {
        &self.page.config().selectors
    }

    fn step_timeout(&self) -> Duration {
        self.page.config().chromium.step_timeout()
    }

    /// Human-ish pause between interactions, like a reader scanning the page.
    async fn idle(&self) {
        let [low, high] = self.step_delay_ms;
        if high == 0 {
            return;
        }
        let millis = rand::thread_rng().gen_range(low.min(high)..=low.max(high));
        sleep(Duration::from_millis(millis)).await;
    }

    fn search_url(&self, identifier: &Identifier) -> String {
        let encoded: String =
            url::form_urlencoded::byte_serialize(identifier.as_str().as_bytes()).collect();
        format!(
            "{}/search?query={encoded}",
            self.page.config().portal.base_url.trim_end_matches('/')
        )
    }

    /// Tags every search-result identifier node whose displayed text equals
    /// the requested identifier exactly, and reports row/match counts.
    fn tag_matches_script(&self, identifier: &Identifier) -> String {
        format!(
            r#"(() => {{
    document.querySelectorAll('[{attr}]').forEach(node => node.removeAttribute('{attr}'));
    let matches = 0;
    document.querySelectorAll({ident_sel}).forEach(node => {{
        const text = (node.innerText || node.textContent || '').trim();
        if (text === {wanted}) {{
            node.setAttribute('{attr}', String(matches));
            matches += 1;
        }}
    }});
    const rows = document.querySelectorAll({row_sel}).length;
    return {{ rows, matches }};
}})()"#,
            attr = MATCH_ATTR,
            ident_sel = js_string(&self.selectors().result_identifier),
            wanted = js_string(identifier.as_str()),
            row_sel = js_string(&self.selectors().result_row),
        )
    }

    /// The portal renders action buttons without stable ids, so they are
    /// found by visible label, tagged with a data attribute, then clicked
    /// through a normal selector.
    fn tag_by_label_script(&self, candidates: &[String], label: &str) -> String {
        let candidates_json =
            serde_json::to_string(candidates).unwrap_or_else(|_| "[]".to_string());
        format!(
            r#"(() => {{
    document.querySelectorAll('[{attr}]').forEach(node => node.removeAttribute('{attr}'));
    const candidates = {candidates_json};
    const label = {label};
    for (const sel of candidates) {{
        for (const node of document.querySelectorAll(sel)) {{
            const text = (node.innerText || node.textContent || '').trim();
            if (text.includes(label)) {{
                node.setAttribute('{attr}', 'target');
                return 1;
            }}
        }}
    }}
    return 0;
}})()"#,
            attr = ACTION_ATTR,
            label = js_string(label),
        )
    }

    async fn click_labeled(&self, candidates: &[String], label: &str) -> WorkflowResult<()> {
        let script = self.tag_by_label_script(candidates, label);
        let tagged: u32 = self.page.evaluate(&script).await.map_err(map_session)?;
        if tagged == 0 {
            return Err(WorkflowError::UiChanged(format!("button \"{label}\"")));
        }
        let selector = format!("[{ACTION_ATTR}='target']");
        let element = self.page.locate(&selector, self.step_timeout()).await?;
        self.page.click(&element).await?;
        trace!(label, "clicked labeled control");
        Ok(())
    }

    async fn wait_for_marker(&self, selector: &str, description: &str) -> WorkflowResult<()> {
        let condition = format!("document.querySelector({}) !== null", js_string(selector));
        self.page
            .wait_for(&condition, description, self.step_timeout())
            .await?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl RegistryPortal for BfoPortal {
    async fn search(&self, identifier: &Identifier) -> WorkflowResult<SearchOutcome> {
        let url = self.search_url(identifier);
        debug!(identifier = %identifier, url = %url, "opening search page");
        self.page.navigate(&url).await?;
        self.idle().await;

        // Bounded wait for result rows; a timeout here may simply mean the
        // registry has nothing for this identifier, so counting decides.
        let rows_condition = format!(
            "document.querySelector({}) !== null",
            js_string(&self.selectors().result_row)
        );
        match self
            .page
            .wait_for(&rows_condition, "search results", self.step_timeout())
            .await
        {
            Ok(()) | Err(BrowserError::Timeout(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let script = self.tag_matches_script(identifier);
        let counts: SearchCounts = self.page.evaluate(&script).await.map_err(map_session)?;
        Ok(SearchOutcome {
            results: counts.rows,
            exact_matches: counts.matches,
        })
    }

    async fn open_organization(&self, identifier: &Identifier) -> WorkflowResult<()> {
        let selector = format!("[{MATCH_ATTR}='0']");
        let element = self.page.locate(&selector, self.step_timeout()).await?;
        self.page.click(&element).await?;
        self.idle().await;
        self.wait_for_marker(
            &self.selectors().organization_marker,
            "organization page",
        )
        .await?;
        debug!(identifier = %identifier, "organization page opened");
        Ok(())
    }

    async fn open_download_dialog(&self) -> WorkflowResult<()> {
        let selectors = self.selectors().clone();
        self.click_labeled(
            &selectors.download_button_candidates,
            &selectors.download_button_label,
        )
        .await?;
        self.idle().await;
        self.wait_for_marker(&selectors.dialog_marker, "download dialog")
            .await
    }

    async fn prepare_download(&self, dir: &Path) -> WorkflowResult<()> {
        std::fs::create_dir_all(dir).map_err(|source| WorkflowError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        self.page.set_download_dir(dir).await?;
        Ok(())
    }

    async fn select_year(&self, year: u16) -> WorkflowResult<()> {
        let selector = self
            .selectors()
            .year_button_template
            .replace("{year}", &year.to_string());
        let element = self.page.locate(&selector, self.step_timeout()).await?;
        self.page.click(&element).await?;
        self.idle().await;
        Ok(())
    }

    async fn select_all_items(&self) -> WorkflowResult<()> {
        let selectors = self.selectors().clone();
        self.click_labeled(&selectors.select_all_candidates, &selectors.select_all_label)
            .await?;
        self.idle().await;
        Ok(())
    }

    async fn request_archive(&self) -> WorkflowResult<()> {
        let selectors = self.selectors().clone();
        self.click_labeled(
            &selectors.archive_button_candidates,
            &selectors.archive_button_label,
        )
        .await?;
        self.idle().await;
        Ok(())
    }

    async fn captcha_present(&self) -> WorkflowResult<bool> {
        for marker in &self.selectors().captcha_markers {
            let condition = format!("document.querySelector({}) !== null", js_string(marker));
            match self.page.evaluate::<bool>(&condition).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err @ BrowserError::Session(_)) => return Err(err.into()),
                Err(_) => {}
            }
        }
        Ok(false)
    }
}

fn map_session(err: BrowserError) -> WorkflowError {
    WorkflowError::from(err)
}

/// JSON-encodes a string for safe embedding in an evaluated script.
fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_string_escapes_quotes() {
        assert_eq!(js_string("a'b\"c"), r#""a'b\"c""#);
    }
}
