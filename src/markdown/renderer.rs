//! Markdown → 图片
//!
//! Markdown 先转成带固定样式的 HTML，再交给 Headless Chrome 截图。
//! 每次渲染使用独立的浏览器上下文和标签页，并发渲染互不干扰；Chrome 调用都是阻塞的，放在 spawn_blocking 里执行。

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::protocol::cdp::Target;
use headless_chrome::types::Bounds;
use headless_chrome::{Browser, LaunchOptions};
use pulldown_cmark::{html, Options, Parser};

use crate::core::RenderError;

/// 渲染能力（流水线只依赖这个 trait）
#[async_trait]
pub trait MarkdownRenderer: Send + Sync {
    /// 渲染为 PNG 字节
    async fn render(&self, markdown: &str) -> Result<Vec<u8>, RenderError>;
}

/// 浏览器启动参数
#[derive(Debug, Clone)]
pub struct RendererOptions {
    /// 显式指定 Chrome / Edge 可执行文件；为空时由 headless_chrome 自行查找
    pub chrome_path: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self {
            chrome_path: None,
            width: 800,
            height: 600,
        }
    }
}

const STYLE: &str = r#"
body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", "PingFang SC", "Microsoft YaHei", sans-serif;
       line-height: 1.6; color: #24292f; background: #fff; max-width: 760px; margin: 0 auto; padding: 20px; }
h1, h2 { border-bottom: 1px solid #eaecef; padding-bottom: 0.3em; }
h1, h2, h3, h4, h5, h6 { margin: 24px 0 16px; font-weight: 600; line-height: 1.25; }
code { background: #f6f8fa; border-radius: 3px; padding: 0.2em 0.4em; font-size: 85%;
       font-family: SFMono-Regular, Consolas, "Liberation Mono", Menlo, monospace; }
pre { background: #f6f8fa; border-radius: 6px; padding: 16px; overflow: auto; font-size: 85%; line-height: 1.45; }
pre code { background: transparent; padding: 0; }
blockquote { margin: 0 0 16px; padding: 0 16px; color: #57606a; border-left: 4px solid #d0d7de; }
table { border-collapse: collapse; margin-bottom: 16px; }
th, td { border: 1px solid #d0d7de; padding: 6px 13px; }
th { background: #f6f8fa; font-weight: 600; }
tr:nth-child(2n) { background: #f6f8fa; }
a { color: #0969da; text-decoration: none; }
hr { border: none; border-top: 1px solid #eaecef; margin: 24px 0; }
img { max-width: 100%; }
"#;

/// Markdown 转完整 HTML 页面
pub fn to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);

    let parser = Parser::new_ext(markdown, options);
    let mut body = String::with_capacity(markdown.len() * 2);
    html::push_html(&mut body, parser);

    format!(
        "<!DOCTYPE html>\n<html lang=\"zh-CN\">\n<head>\n<meta charset=\"UTF-8\">\n<style>{}</style>\n</head>\n<body>\n{}</body>\n</html>",
        STYLE, body
    )
}

/// Headless Chrome 渲染器：init() 启动浏览器，destroy() 释放
pub struct ChromeRenderer {
    options: RendererOptions,
    browser: Mutex<Option<Arc<Browser>>>,
}

impl ChromeRenderer {
    pub fn new(options: RendererOptions) -> Self {
        Self {
            options,
            browser: Mutex::new(None),
        }
    }

    fn browser_guard(&self) -> MutexGuard<'_, Option<Arc<Browser>>> {
        self.browser.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_initialized(&self) -> bool {
        self.browser_guard().is_some()
    }

    /// 启动浏览器
    pub async fn init(&self) -> Result<(), RenderError> {
        if self.is_initialized() {
            return Ok(());
        }

        let options = self.options.clone();
        let browser = tokio::task::spawn_blocking(move || {
            let launch = LaunchOptions::default_builder()
                .headless(true)
                .sandbox(false)
                .window_size(Some((options.width, options.height)))
                .path(options.chrome_path.clone())
                .idle_browser_timeout(Duration::from_secs(60 * 60 * 24 * 365))
                .build()
                .map_err(|e| RenderError::Launch(e.to_string()))?;
            if let Some(path) = &options.chrome_path {
                tracing::info!(path = %path.display(), "使用浏览器");
            }
            Browser::new(launch).map_err(|e| RenderError::Launch(e.to_string()))
        })
        .await
        .map_err(|e| RenderError::Launch(format!("Task join: {}", e)))??;

        *self.browser_guard() = Some(Arc::new(browser));
        tracing::info!("Markdown 渲染器已初始化");
        Ok(())
    }

    /// 关闭浏览器；未初始化时什么也不做
    pub async fn destroy(&self) {
        let browser = self.browser_guard().take();
        if let Some(browser) = browser {
            // Browser 的 Drop 会等待子进程退出
            let _ = tokio::task::spawn_blocking(move || drop(browser)).await;
            tracing::info!("Markdown 渲染器已关闭");
        }
    }
}

/// Chrome 单次截图高度上限
const MAX_VIEWPORT_HEIGHT: u32 = 16_384;

/// 截图前的视口高度：不低于配置高度，内容更长时撑到 scrollHeight
fn viewport_height(min_height: u32, scroll_height: Option<f64>) -> u32 {
    let content = scroll_height
        .filter(|h| h.is_finite() && *h > 0.0)
        .map(|h| h.ceil().min(MAX_VIEWPORT_HEIGHT as f64) as u32)
        .unwrap_or(0);
    min_height.max(content).min(MAX_VIEWPORT_HEIGHT)
}

fn render_blocking(
    browser: &Browser,
    options: &RendererOptions,
    html: &str,
) -> Result<Vec<u8>, RenderError> {
    let context = browser
        .new_context()
        .map_err(|e| RenderError::Render(format!("Browser context failed: {}", e)))?;
    let context_id = context.get_id().to_string();
    let tab = context
        .new_tab()
        .map_err(|e| RenderError::Render(format!("Browser tab failed: {}", e)))?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(html.as_bytes());
    let url = format!("data:text/html;charset=utf-8;base64,{}", encoded);

    let shot = (|| {
        tab.navigate_to(&url)
            .map_err(|e| RenderError::Render(format!("Navigate failed: {}", e)))?;
        tab.wait_until_navigated()
            .map_err(|e| RenderError::Render(format!("Page load failed: {}", e)))?;
        tab.wait_for_element("body")
            .map_err(|e| RenderError::Render(format!("Body not found: {}", e)))?;

        let scroll_height = tab
            .evaluate("document.body.scrollHeight", false)
            .map_err(|e| RenderError::Render(format!("Measure failed: {}", e)))?
            .value
            .and_then(|v| v.as_f64());
        let height = viewport_height(options.height, scroll_height);
        tab.set_bounds(Bounds::Normal {
            left: None,
            top: None,
            width: Some(options.width as f64),
            height: Some(height as f64),
        })
        .map_err(|e| RenderError::Render(format!("Resize failed: {}", e)))?;
        tracing::debug!(height, "视口已按内容调整");

        // 调整尺寸后重新定位 body，拿到新的盒模型
        let body = tab
            .wait_for_element("body")
            .map_err(|e| RenderError::Render(format!("Body not found: {}", e)))?;
        body.capture_screenshot(CaptureScreenshotFormatOption::Png)
            .map_err(|e| RenderError::Render(format!("Screenshot failed: {}", e)))
    })();

    if let Err(e) = tab.close(true) {
        tracing::debug!(error = %e, "关闭标签页失败");
    }
    if let Err(e) = browser.call_method(Target::DisposeBrowserContext {
        browser_context_id: context_id,
    }) {
        tracing::debug!(error = %e, "释放浏览器上下文失败");
    }
    shot
}

#[async_trait]
impl MarkdownRenderer for ChromeRenderer {
    async fn render(&self, markdown: &str) -> Result<Vec<u8>, RenderError> {
        let browser = self
            .browser_guard()
            .as_ref()
            .map(Arc::clone)
            .ok_or(RenderError::NotInitialized)?;
        let html = to_html(markdown);
        let options = self.options.clone();

        let png = tokio::task::spawn_blocking(move || render_blocking(&browser, &options, &html))
            .await
            .map_err(|e| RenderError::Render(format!("Task join: {}", e)))??;
        tracing::debug!(bytes = png.len(), "Markdown 渲染完成");
        Ok(png)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_html_features() {
        let html = to_html("# 标题\n\n**粗体** ~~删除~~\n\n| a | b |\n|---|---|\n| 1 | 2 |\n");
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<h1>标题</h1>"));
        assert!(html.contains("<strong>粗体</strong>"));
        assert!(html.contains("<del>删除</del>"));
        assert!(html.contains("<table>"));
        assert!(html.contains("charset=\"UTF-8\""));
    }

    #[test]
    fn test_viewport_height_follows_content() {
        // 短内容保持配置高度
        assert_eq!(viewport_height(600, Some(320.0)), 600);
        // 长内容撑开，向上取整
        assert_eq!(viewport_height(600, Some(2400.4)), 2401);
        // 测量失败或异常值时回落到配置高度
        assert_eq!(viewport_height(600, None), 600);
        assert_eq!(viewport_height(600, Some(f64::NAN)), 600);
        assert_eq!(viewport_height(600, Some(-5.0)), 600);
        // 超长页面截断到上限
        assert_eq!(viewport_height(600, Some(1.0e7)), MAX_VIEWPORT_HEIGHT);
    }

    #[tokio::test]
    async fn test_render_before_init_fails() {
        let renderer = ChromeRenderer::new(RendererOptions::default());
        assert!(!renderer.is_initialized());
        assert_eq!(
            renderer.render("**x**").await,
            Err(RenderError::NotInitialized)
        );
        // destroy 未初始化的渲染器是空操作
        renderer.destroy().await;
    }

    fn png_size(png: &[u8]) -> (u32, u32) {
        let w = u32::from_be_bytes([png[16], png[17], png[18], png[19]]);
        let h = u32::from_be_bytes([png[20], png[21], png[22], png[23]]);
        (w, h)
    }

    #[tokio::test]
    #[ignore = "需要本机安装 Chrome"]
    async fn test_long_page_is_captured_and_context_disposed() {
        let renderer = ChromeRenderer::new(RendererOptions::default());
        renderer.init().await.unwrap();

        let markdown = (0..80)
            .map(|i| format!("第 {} 段\n\n", i))
            .collect::<String>();
        let png = renderer.render(&markdown).await.unwrap();
        assert_eq!(&png[1..4], b"PNG");
        let (_, height) = png_size(&png);
        assert!(height > 600, "height = {}", height);

        let browser = renderer.browser_guard().as_ref().map(Arc::clone).unwrap();
        let contexts = tokio::task::spawn_blocking(move || {
            browser.call_method(Target::GetBrowserContexts(None))
        })
        .await
        .unwrap()
        .unwrap();
        assert!(contexts.browser_context_ids.is_empty());

        renderer.destroy().await;
    }
}
