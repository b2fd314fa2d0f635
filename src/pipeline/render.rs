//! Headless rendering: load an HTML string, await typesetting, capture a
//! full-page raster.
//!
//! The browser is driven over CDP via `chromiumoxide`. One renderer owns
//! one logical browser and is **serialized**: callers render one page at a
//! time, which is exactly what the per-page loop does.
//!
//! ## The MathJax wait
//!
//! Equations typeset asynchronously after `load`. Capturing too early
//! produces a raster where every formula is raw LaTeX, and the judges
//! would then demolish the equation score for an artifact of timing. The
//! fix: when the document references MathJax, probe for the
//! `MathJax.startup.promise` global and await it — under a hard upper
//! bound, because a CDN hiccup must produce a [`RenderFailure`] the loop
//! can budget, never an indefinite hang. A document that simply never
//! loads MathJax falls through the probe without error.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// A failed render step. The loop converts this into a zero-signal
/// iteration that counts against the retry budget.
#[derive(Debug, Error)]
#[error("{detail}")]
pub struct RenderFailure {
    pub detail: String,
}

impl RenderFailure {
    fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Rasterise an HTML string to a PNG on disk.
///
/// The trait seam keeps the loop testable without a browser; production
/// uses [`ChromiumRenderer`].
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, html: &str, output_path: &Path) -> Result<(), RenderFailure>;
}

/// Chromium-backed renderer with a fixed viewport and bounded waits.
pub struct ChromiumRenderer {
    viewport: (u32, u32),
    step_timeout: Duration,
}

impl ChromiumRenderer {
    pub fn new(viewport: (u32, u32), step_timeout_secs: u64) -> Self {
        Self {
            viewport,
            step_timeout: Duration::from_secs(step_timeout_secs),
        }
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn render(&self, html: &str, output_path: &Path) -> Result<(), RenderFailure> {
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RenderFailure::new(format!("create output dir: {e}")))?;
        }

        // The browser can only navigate to a path, so the HTML goes to a
        // scratch file that lives until the capture completes.
        let scratch = tempfile::Builder::new()
            .prefix("pdf2html-render-")
            .suffix(".html")
            .tempfile()
            .map_err(|e| RenderFailure::new(format!("scratch file: {e}")))?;
        tokio::fs::write(scratch.path(), html)
            .await
            .map_err(|e| RenderFailure::new(format!("scratch write: {e}")))?;

        let config = BrowserConfig::builder()
            .window_size(self.viewport.0, self.viewport.1)
            .build()
            .map_err(|e| RenderFailure::new(format!("browser config: {e}")))?;

        let (mut browser, mut handler) = timeout(self.step_timeout, Browser::launch(config))
            .await
            .map_err(|_| RenderFailure::new(format!("browser launch timed out after {:?}", self.step_timeout)))?
            .map_err(|e| RenderFailure::new(format!("browser launch: {e}")))?;

        // The handler must be polled for the connection to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let result = self.capture(&browser, scratch.path(), html, output_path).await;

        browser.close().await.ok();
        browser.wait().await.ok();
        handler_task.abort();
        result
    }
}

impl ChromiumRenderer {
    async fn capture(
        &self,
        browser: &Browser,
        html_path: &Path,
        html: &str,
        output_path: &Path,
    ) -> Result<(), RenderFailure> {
        let url = format!("file://{}", html_path.display());

        let page = timeout(self.step_timeout, browser.new_page(url.as_str()))
            .await
            .map_err(|_| RenderFailure::new(format!("navigation timed out after {:?}", self.step_timeout)))?
            .map_err(|e| RenderFailure::new(format!("navigation: {e}")))?;

        timeout(self.step_timeout, page.wait_for_navigation())
            .await
            .map_err(|_| RenderFailure::new(format!("load wait timed out after {:?}", self.step_timeout)))?
            .map_err(|e| RenderFailure::new(format!("load wait: {e}")))?;

        if mentions_mathjax(html) {
            self.await_mathjax(&page).await?;
        }

        // Settle delay in lieu of a network-idle signal: fonts and data
        // URIs decode quickly once load has fired.
        sleep(Duration::from_millis(500)).await;

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        let png = timeout(self.step_timeout, page.screenshot(params))
            .await
            .map_err(|_| RenderFailure::new(format!("capture timed out after {:?}", self.step_timeout)))?
            .map_err(|e| RenderFailure::new(format!("capture: {e}")))?;

        tokio::fs::write(output_path, &png)
            .await
            .map_err(|e| RenderFailure::new(format!("write {}: {e}", output_path.display())))?;

        debug!("rendered {} bytes → {}", png.len(), output_path.display());
        Ok(())
    }

    /// Probe for the MathJax global, then await its startup promise.
    ///
    /// The probe is best-effort: a page that never defines the global is
    /// not an error. Once the global exists, an unresolved startup promise
    /// past the step timeout *is* an error — typesetting genuinely hung.
    async fn await_mathjax(&self, page: &chromiumoxide::Page) -> Result<(), RenderFailure> {
        const PROBE: &str =
            "typeof MathJax !== 'undefined' && !!(MathJax.startup && MathJax.startup.promise)";
        const PROBE_ATTEMPTS: u32 = 10;

        let mut found = false;
        for _ in 0..PROBE_ATTEMPTS {
            match page.evaluate(PROBE).await {
                Ok(result) => {
                    if result.into_value::<bool>().unwrap_or(false) {
                        found = true;
                        break;
                    }
                }
                Err(e) => {
                    warn!("MathJax probe failed: {e}");
                    break;
                }
            }
            sleep(Duration::from_millis(500)).await;
        }

        if !found {
            debug!("MathJax global never appeared; capturing without typeset wait");
            return Ok(());
        }

        timeout(
            self.step_timeout,
            page.evaluate("MathJax.startup.promise.then(() => true)"),
        )
        .await
        .map_err(|_| {
            RenderFailure::new(format!(
                "MathJax typesetting did not finish within {:?}",
                self.step_timeout
            ))
        })?
        .map_err(|e| RenderFailure::new(format!("MathJax wait: {e}")))?;

        Ok(())
    }
}

fn mentions_mathjax(html: &str) -> bool {
    html.to_ascii_lowercase().contains("mathjax")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mathjax_detection_is_case_insensitive() {
        assert!(mentions_mathjax("<script src=\"https://cdn.jsdelivr.net/npm/mathjax@3\"></script>"));
        assert!(mentions_mathjax("<script>MathJax = {};</script>"));
        assert!(!mentions_mathjax("<html><body>no math here</body></html>"));
    }

    #[test]
    fn render_failure_displays_detail() {
        let e = RenderFailure::new("navigation timed out after 30s");
        assert!(e.to_string().contains("timed out"));
    }
}
