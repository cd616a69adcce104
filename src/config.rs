//! 应用配置：从 config/default.toml、命令行指定的文件与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `NAPBOT__*` 覆盖（双下划线表示嵌套，如 `NAPBOT__NAPCAT__HOST=10.0.0.2`）。
//! 未配置 `[[targets]]` 时兼容旧部署的 `TARGET_GROUP_ID` / `TARGET_USER_ID`。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::bot::{FallbackTexts, MonitoredTarget};
use crate::core::BotError;
use crate::markdown::RendererOptions;

/// 应用配置根
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub napcat: NapcatSection,
    #[serde(default)]
    pub targets: Vec<MonitoredTarget>,
    #[serde(default)]
    pub bot: BotSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub renderer: RendererSection,
}

/// [napcat] 段：两条 WebSocket 的地址、令牌与重连策略
#[derive(Debug, Clone, Deserialize)]
pub struct NapcatSection {
    #[serde(default = "default_host")]
    pub host: String,
    /// 事件推送端口
    #[serde(default = "default_event_port")]
    pub event_port: u16,
    /// API 调用端口
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    pub access_token: Option<String>,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// API 连接晚于事件连接启动
    #[serde(default = "default_api_connect_delay_secs")]
    pub api_connect_delay_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_event_port() -> u16 {
    3002
}

fn default_api_port() -> u16 {
    3001
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_api_connect_delay_secs() -> u64 {
    2
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for NapcatSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            event_port: default_event_port(),
            api_port: default_api_port(),
            access_token: None,
            reconnect_delay_secs: default_reconnect_delay_secs(),
            api_connect_delay_secs: default_api_connect_delay_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl NapcatSection {
    pub fn event_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.event_port)
    }

    pub fn api_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.api_port)
    }

    /// 空字符串视为未配置
    pub fn token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// [bot] 段：机器人名字与兜底文案
#[derive(Debug, Clone, Deserialize)]
pub struct BotSection {
    #[serde(default = "default_bot_name")]
    pub name: String,
    #[serde(default = "default_apology_text")]
    pub apology_text: String,
    #[serde(default = "default_render_failure_text")]
    pub render_failure_text: String,
    #[serde(default = "default_quote_unavailable_text")]
    pub quote_unavailable_text: String,
}

fn default_bot_name() -> String {
    "小幻梦".to_string()
}

fn default_apology_text() -> String {
    FallbackTexts::default().apology
}

fn default_render_failure_text() -> String {
    FallbackTexts::default().render_failure
}

fn default_quote_unavailable_text() -> String {
    "（引用的消息无法获取）".to_string()
}

impl Default for BotSection {
    fn default() -> Self {
        Self {
            name: default_bot_name(),
            apology_text: default_apology_text(),
            render_failure_text: default_render_failure_text(),
            quote_unavailable_text: default_quote_unavailable_text(),
        }
    }
}

impl BotSection {
    pub fn fallback_texts(&self) -> FallbackTexts {
        FallbackTexts {
            apology: self.apology_text.clone(),
            render_failure: self.render_failure_text.clone(),
        }
    }
}

/// [llm] 段：OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: Option<String>,
    /// 未设置时读 GEMINI_API_KEY / OPENAI_API_KEY
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// HTTP 代理，如 http://127.0.0.1:7890
    pub proxy: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_base_url() -> Option<String> {
    Some("https://generativelanguage.googleapis.com/v1beta/openai".to_string())
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_system_prompt() -> String {
    format!(
        "你是 QQ 群里的聊天助手「{}」。回答简洁友好；需要列表、表格或代码时可以使用 Markdown。",
        default_bot_name()
    )
}

fn default_llm_timeout_secs() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            proxy: None,
            system_prompt: default_system_prompt(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

/// [renderer] 段：浏览器路径与视口
#[derive(Debug, Clone, Deserialize)]
pub struct RendererSection {
    pub chrome_path: Option<PathBuf>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

fn default_width() -> u32 {
    800
}

fn default_height() -> u32 {
    600
}

impl Default for RendererSection {
    fn default() -> Self {
        Self {
            chrome_path: None,
            width: default_width(),
            height: default_height(),
        }
    }
}

impl RendererSection {
    pub fn options(&self) -> RendererOptions {
        RendererOptions {
            chrome_path: self.chrome_path.clone(),
            width: self.width,
            height: self.height,
        }
    }
}

impl AppConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.napcat.reconnect_delay_secs)
    }

    pub fn api_connect_delay(&self) -> Duration {
        Duration::from_secs(self.napcat.api_connect_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.napcat.request_timeout_secs)
    }

    /// 旧部署只有一个目标，通过 TARGET_GROUP_ID / TARGET_USER_ID 指定
    pub fn apply_legacy_target(
        &mut self,
        group_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), BotError> {
        if !self.targets.is_empty() {
            return Ok(());
        }
        let Some(group) = group_id.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(());
        };
        let group_id = group
            .parse::<i64>()
            .map_err(|_| BotError::Config(format!("TARGET_GROUP_ID 不是有效的群号: {}", group)))?;
        let user_id = match user_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(user) => Some(
                user.parse::<i64>()
                    .map_err(|_| BotError::Config(format!("TARGET_USER_ID 不是有效的 QQ 号: {}", user)))?,
            ),
            None => None,
        };
        self.targets.push(MonitoredTarget { group_id, user_id });
        Ok(())
    }

    /// 启动前校验；任何错误都会让进程以非零码退出
    pub fn validate(&self) -> Result<(), BotError> {
        if self.targets.is_empty() {
            return Err(BotError::Config(
                "未配置监控目标（[[targets]] 或 TARGET_GROUP_ID）".to_string(),
            ));
        }
        if let Some(t) = self.targets.iter().find(|t| t.group_id == 0) {
            return Err(BotError::Config(format!("无效的群号: {:?}", t)));
        }
        if self.napcat.event_port == 0 || self.napcat.api_port == 0 {
            return Err(BotError::Config("NapCat 端口不能为 0".to_string()));
        }
        if self.napcat.host.trim().is_empty() {
            return Err(BotError::Config("NapCat host 不能为空".to_string()));
        }
        if !matches!(self.llm.provider.as_str(), "openai" | "mock") {
            return Err(BotError::Config(format!(
                "未知的 LLM provider: {}",
                self.llm.provider
            )));
        }
        Ok(())
    }
}

/// 加载配置，环境变量 NAPBOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在，可覆盖前面的键）
/// 3. 叠加环境变量 NAPBOT__*（双下划线表示嵌套键）
/// 4. 没有 targets 时读取 TARGET_GROUP_ID / TARGET_USER_ID
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, BotError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "default"] {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("NAPBOT")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.apply_legacy_target(
        std::env::var("TARGET_GROUP_ID").ok().as_deref(),
        std::env::var("TARGET_USER_ID").ok().as_deref(),
    )?;
    Ok(cfg)
}
