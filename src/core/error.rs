//! 错误类型
//!
//! 网关层（RPC / 会话）、LLM、渲染器各自一组错误；Action Pipeline 把下游错误全部降级为兜底回复，不再向上传播。

use thiserror::Error;

/// NapCat 网关调用错误（RPC 请求方自行决定是否重试，本层不自动重试）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// 会话未处于 Open 状态，请求未发出
    #[error("WebSocket 连接未建立")]
    NotConnected,

    /// 超时未收到响应，pending 条目已移除
    #[error("请求超时")]
    Timeout,

    /// 网关返回失败
    #[error("网关返回错误: {0}")]
    RemoteError(String),

    /// 请求未完成时连接断开
    #[error("WebSocket 连接已断开")]
    ConnectionLost,

    /// 入站数据无法解析
    #[error("无法解析的帧: {0}")]
    MalformedFrame(String),

    /// 建连 / 握手 / 写入失败
    #[error("传输错误: {0}")]
    Transport(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Transport(e.to_string())
    }
}

/// 补全服务错误：空结果也算失败（可恢复）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("LLM 返回为空")]
    EmptyResponse,

    #[error("LLM 请求失败: {0}")]
    Request(String),
}

/// 渲染器错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("渲染器未初始化，请先调用 init()")]
    NotInitialized,

    #[error("浏览器启动失败: {0}")]
    Launch(String),

    #[error("渲染失败: {0}")]
    Render(String),
}

/// 引用图片获取失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("不支持的图片来源: {0}")]
    UnsupportedSource(String),

    #[error("图片下载失败: {0}")]
    Download(String),

    #[error("base64 解码失败: {0}")]
    Decode(String),
}

/// 启动阶段错误（配置、渲染器初始化），出现即以非零码退出
#[derive(Error, Debug)]
pub enum BotError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error(transparent)]
    ConfigLoad(#[from] config::ConfigError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
