//! napbot - NapCat（OneBot 11）QQ 群机器人
//!
//! 模块划分：
//! - **gateway**: 两条 WebSocket 会话、echo 关联表、帧编解码、出站消息
//! - **cq**: 消息文本中的 CQ 码解析（回复 / @ / 图片）
//! - **bot**: 事件分类、引用解析、动作流水线与整体装配
//! - **markdown**: Markdown 特征检测与 Headless Chrome 渲染
//! - **llm**: 补全服务抽象与实现（OpenAI 兼容 / Mock）
//! - **config**: 配置加载（TOML + 环境变量）
//! - **core**: 错误类型、优雅关闭
//! - **observability**: 日志

pub mod bot;
pub mod config;
pub mod core;
pub mod cq;
pub mod gateway;
pub mod llm;
pub mod markdown;
pub mod observability;

pub use bot::Bot;
pub use config::{load_config, AppConfig};
