use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;

use super::error::{BrowserError, BrowserResult};

const LOCATE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct LaunchOverrides {
    pub headless: Option<bool>,
}

/// Builds and launches the one Chromium instance a run owns.
#[derive(Debug, Clone)]
pub struct SessionLauncher {
    config: Arc<BrowserConfig>,
    download_dir: PathBuf,
}

impl SessionLauncher {
    pub fn new(config: BrowserConfig, download_dir: impl AsRef<Path>) -> Self {
        Self {
            config: Arc::new(config),
            download_dir: download_dir.as_ref().to_path_buf(),
        }
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    pub async fn launch(&self) -> BrowserResult<Session> {
        self.launch_with_overrides(LaunchOverrides::default()).await
    }

    pub async fn launch_with_overrides(
        &self,
        overrides: LaunchOverrides,
    ) -> BrowserResult<Session> {
        std::fs::create_dir_all(&self.download_dir)?;
        let headless = overrides.headless.unwrap_or(self.config.chromium.headless);
        let chromium_config = self.build_chromium_config(headless)?;
        info!(
            headless,
            download_dir = %self.download_dir.display(),
            "launching chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        Ok(Session {
            browser,
            handler_task: Some(handler_task),
            config: Arc::clone(&self.config),
            download_dir: self.download_dir.clone(),
        })
    }

    fn build_chromium_config(&self, headless: bool) -> BrowserResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder();
        if !self.config.chromium.executable_path.is_empty() {
            builder = builder.chrome_executable(&self.config.chromium.executable_path);
        }
        if !headless {
            builder = builder.with_head();
        }
        if !self.config.chromium.sandbox {
            builder = builder.no_sandbox();
        }
        builder = builder.request_timeout(self.config.chromium.nav_timeout());

        let mut args = vec![
            format!("--user-agent={}", self.config.portal.user_agent),
            "--no-first-run".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--disable-dev-shm-usage".to_string(),
        ];
        if self.config.chromium.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if let Some(accept) = &self.config.portal.accept_language {
            args.push(format!("--accept-lang={accept}"));
        }
        builder = builder.args(args);

        builder.build().map_err(BrowserError::Configuration)
    }
}

/// One live browser automation session. Owns the Chromium process handle and
/// the event-handler drain task; scoped to the whole run.
#[derive(Debug)]
pub struct Session {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
    config: Arc<BrowserConfig>,
    download_dir: PathBuf,
}

impl Session {
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    pub async fn open_page(&self) -> BrowserResult<SessionPage> {
        let page = self.browser.new_page("about:blank").await?;
        self.configure_page(&page).await?;
        let session_page = SessionPage {
            page,
            config: Arc::clone(&self.config),
        };
        session_page.set_download_dir(&self.download_dir).await?;
        Ok(session_page)
    }

    pub async fn shutdown(mut self) -> BrowserResult<()> {
        info!("shutting down chromium instance");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        Ok(())
    }

    async fn configure_page(&self, page: &Page) -> BrowserResult<()> {
        let mut params_builder =
            SetUserAgentOverrideParams::builder().user_agent(self.config.portal.user_agent.clone());
        if let Some(accept) = &self.config.portal.accept_language {
            params_builder = params_builder.accept_language(accept.clone());
        }
        let params = params_builder.build().map_err(BrowserError::Configuration)?;
        page.set_user_agent(params).await?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("session dropped without explicit shutdown");
            }
        }
    }
}

/// Bounded navigate/locate/click/wait primitives over one page. Every wait
/// carries an explicit timeout; nothing here blocks unbounded.
#[derive(Debug)]
pub struct SessionPage {
    page: Page,
    config: Arc<BrowserConfig>,
}

impl SessionPage {
    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    pub async fn navigate(&self, url: &str) -> BrowserResult<()> {
        let nav = async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, BrowserError>(())
        };
        tokio::time::timeout(self.config.chromium.nav_timeout(), nav)
            .await
            .map_err(|_| BrowserError::Timeout(format!("navigation to {url}")))?
    }

    /// Polls for the selector until it appears or the timeout elapses.
    /// A missing element is recoverable; it never takes the session down.
    pub async fn locate(&self, selector: &str, timeout: Duration) -> BrowserResult<Element> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(element) = self.page.find_element(selector).await {
                return Ok(element);
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::ElementNotFound(selector.to_string()));
            }
            sleep(LOCATE_POLL_INTERVAL).await;
        }
    }

    /// Clicks an element handle. A CDP failure here usually means the node
    /// went stale under us, so it maps to a recoverable error and the caller
    /// re-locates on retry.
    pub async fn click(&self, element: &Element) -> BrowserResult<()> {
        element
            .click()
            .await
            .map(|_| ())
            .map_err(|err| BrowserError::Stale(err.to_string()))
    }

    /// Polls a boolean JS expression until it is true or the timeout elapses.
    pub async fn wait_for(
        &self,
        condition: &str,
        description: &str,
        timeout: Duration,
    ) -> BrowserResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.evaluate::<bool>(condition).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err @ BrowserError::Session(_)) => return Err(err),
                Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout(description.to_string()));
            }
            sleep(LOCATE_POLL_INTERVAL).await;
        }
    }

    /// Redirects where Chromium writes downloads triggered from this page.
    /// Called per (identifier, year) so archives land in their final place.
    pub async fn set_download_dir(&self, dir: &Path) -> BrowserResult<()> {
        let params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(dir.to_string_lossy().to_string())
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.execute(params).await?;
        Ok(())
    }

    pub async fn evaluate<T: DeserializeOwned>(&self, script: &str) -> BrowserResult<T> {
        self.page
            .evaluate(script)
            .await?
            .into_value()
            .map_err(|err| BrowserError::Unexpected(format!("failed to decode payload: {err}")))
    }
}
