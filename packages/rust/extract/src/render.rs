//! Scriptable-browser rendering for pages that need JavaScript.

use async_trait::async_trait;
use url::Url;

use autonews_shared::Result;

use crate::engine::RequestProfile;

/// Renders a page and returns the resulting document HTML.
///
/// Implementations must honour the proxy, headers and user agent of the
/// request profile.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &Url, profile: &RequestProfile) -> Result<String>;

    /// Name for tracing.
    fn name(&self) -> &str;
}

#[cfg(feature = "browser")]
pub use chromium::ChromiumRenderer;

#[cfg(feature = "browser")]
mod chromium {
    use std::time::Duration;

    use async_trait::async_trait;
    use chromiumoxide::browser::{Browser, BrowserConfig};
    use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
    use futures::StreamExt;
    use tracing::{debug, instrument};
    use url::Url;

    use autonews_shared::{AutoNewsError, Result};

    use super::PageRenderer;
    use crate::engine::RequestProfile;

    /// Headless Chromium renderer. Launches one browser per render so each
    /// source's proxy applies.
    pub struct ChromiumRenderer {
        timeout: Duration,
    }

    impl ChromiumRenderer {
        pub fn new(timeout: Duration) -> Self {
            Self { timeout }
        }
    }

    fn render_err(url: &Url, e: impl std::fmt::Display) -> AutoNewsError {
        AutoNewsError::extraction(url.as_str(), format!("browser render failed: {e}"))
    }

    #[async_trait]
    impl PageRenderer for ChromiumRenderer {
        #[instrument(skip_all, fields(url = %url))]
        async fn render(&self, url: &Url, profile: &RequestProfile) -> Result<String> {
            let mut builder = BrowserConfig::builder()
                .request_timeout(self.timeout)
                .arg(format!("--user-agent={}", profile.user_agent));
            if let Some(proxy) = &profile.proxy {
                builder = builder.arg(format!("--proxy-server={proxy}"));
            }
            let config = builder.build().map_err(|e| render_err(url, e))?;

            let (mut browser, mut handler) =
                Browser::launch(config).await.map_err(|e| render_err(url, e))?;
            let handler_task = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
            });

            let result = async {
                let page = browser
                    .new_page("about:blank")
                    .await
                    .map_err(|e| render_err(url, e))?;

                let mut headers = serde_json::Map::new();
                for (name, value) in &profile.headers {
                    headers.insert(name.clone(), serde_json::Value::String(value.clone()));
                }
                if let Some(since) = profile.if_modified_since_header() {
                    headers.insert("If-Modified-Since".into(), serde_json::Value::String(since));
                }
                if !headers.is_empty() {
                    page.execute(SetExtraHttpHeadersParams::new(Headers::new(
                        serde_json::Value::Object(headers),
                    )))
                    .await
                    .map_err(|e| render_err(url, e))?;
                }

                page.goto(url.as_str())
                    .await
                    .map_err(|e| render_err(url, e))?;
                page.wait_for_navigation()
                    .await
                    .map_err(|e| render_err(url, e))?;
                page.content().await.map_err(|e| render_err(url, e))
            }
            .await;

            let _ = browser.close().await;
            handler_task.abort();

            let html = result?;
            debug!(len = html.len(), "page rendered");
            Ok(html)
        }

        fn name(&self) -> &str {
            "chromium"
        }
    }
}
