//! Markdown：特征检测与图片渲染

pub mod detector;
pub mod renderer;

pub use detector::{detect, is_markdown, Detection, MarkdownFeature};
pub use renderer::{to_html, ChromeRenderer, MarkdownRenderer, RendererOptions};
