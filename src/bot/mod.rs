//! 机器人：把两条会话、关联表、分类器、流水线和渲染器装配在一起
//!
//! - **classifier**：监控目标过滤与分支选择
//! - **quote**：引用消息解析（文本上下文 / 图片内联）
//! - **pipeline**：每个事件恰好一个出站动作
//!
//! 关闭顺序固定：停止会话（不再重连）→ 清空 pending 请求 → 释放渲染器。

pub mod classifier;
pub mod pipeline;
pub mod quote;

pub use classifier::{Admitted, EventClassifier, MonitoredTarget, Route};
pub use pipeline::{ActionPipeline, FallbackTexts, Outcome, SkipReason};
pub use quote::{sniff_mime, HttpMediaFetcher, MediaFetcher, QuoteContext, QuoteResolver};

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{BotError, ShutdownCleanup, ShutdownCoordinator};
use crate::gateway::{
    CorrelationRegistry, EventSink, FrameRouter, InboundEvent, NapCatApi, SessionConfig,
    SessionState, TransportSession,
};
use crate::llm::{CompletionProvider, MockProvider, OpenAiProvider};
use crate::markdown::ChromeRenderer;

/// 事件会话的处理者：过滤后把流水线放到独立任务里执行
struct PipelineSink {
    classifier: EventClassifier,
    pipeline: Arc<ActionPipeline>,
}

impl EventSink for PipelineSink {
    fn on_event(&self, event: InboundEvent) {
        let Some(admitted) = self.classifier.classify(event) else {
            return;
        };
        tracing::info!(
            group_id = admitted.group_id,
            user_id = admitted.event.user_id,
            message_id = admitted.event.message_id,
            route = ?admitted.route,
            "收到目标用户消息"
        );
        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(async move {
            pipeline.handle(admitted).await;
        });
    }
}

pub struct Bot {
    config: AppConfig,
    event_session: Arc<TransportSession>,
    api_session: Arc<TransportSession>,
    registry: Arc<CorrelationRegistry>,
    api: Arc<NapCatApi>,
    renderer: Arc<ChromeRenderer>,
    sink: Arc<PipelineSink>,
}

fn build_provider(config: &AppConfig) -> Result<Arc<dyn CompletionProvider>, BotError> {
    let llm = &config.llm;
    if llm.provider == "mock" {
        tracing::warn!("使用 Mock LLM");
        return Ok(Arc::new(MockProvider));
    }
    let provider = OpenAiProvider::new(
        llm.base_url.as_deref(),
        &llm.model,
        llm.api_key.as_deref(),
        llm.proxy.as_deref(),
        Duration::from_secs(llm.timeout_secs),
    )?
    .with_system_prompt(llm.system_prompt.clone());
    tracing::info!(model = %llm.model, "LLM 已配置");
    Ok(Arc::new(provider))
}

impl Bot {
    pub fn new(config: AppConfig) -> Result<Self, BotError> {
        let napcat = &config.napcat;
        let token = napcat.token().map(String::from);

        let event_session = Arc::new(TransportSession::new(SessionConfig {
            access_token: token.clone(),
            reconnect_delay: config.reconnect_delay(),
            ..SessionConfig::new("event", &napcat.event_url())
        }));
        let api_session = Arc::new(TransportSession::new(SessionConfig {
            access_token: token,
            reconnect_delay: config.reconnect_delay(),
            initial_delay: config.api_connect_delay(),
            ..SessionConfig::new("api", &napcat.api_url())
        }));

        let registry = Arc::new(CorrelationRegistry::new(
            api_session.clone(),
            config.request_timeout(),
        ));
        let api = Arc::new(NapCatApi::new(Arc::clone(&registry)));
        let renderer = Arc::new(ChromeRenderer::new(config.renderer.options()));
        let media = Arc::new(HttpMediaFetcher::new(config.request_timeout())?);

        let quotes = QuoteResolver::new(
            api.clone(),
            media,
            config.bot.quote_unavailable_text.clone(),
        );
        let pipeline = Arc::new(ActionPipeline::new(
            api.clone(),
            build_provider(&config)?,
            renderer.clone(),
            quotes,
            config.bot.fallback_texts(),
        ));
        let sink = Arc::new(PipelineSink {
            classifier: EventClassifier::new(config.targets.clone()),
            pipeline,
        });

        Ok(Self {
            config,
            event_session,
            api_session,
            registry,
            api,
            renderer,
            sink,
        })
    }

    /// 启动浏览器；失败即为启动失败
    pub async fn init_renderer(&self) -> Result<(), BotError> {
        tracing::info!("初始化 Markdown 渲染器...");
        self.renderer.init().await?;
        Ok(())
    }

    /// 启动两条会话与各自的帧分发
    pub fn start(&self) -> Result<(), BotError> {
        let targets = self.sink.classifier.targets();
        tracing::info!(name = %self.config.bot.name, "监控 {} 个目标:", targets.len());
        for (i, target) in targets.iter().enumerate() {
            tracing::info!("  {}. {}", i + 1, target);
        }

        let event_rx = self.event_session.start()?;
        let sink: Arc<dyn EventSink> = self.sink.clone();
        tokio::spawn(
            FrameRouter::for_events("event", Arc::clone(&self.registry), sink).run(event_rx),
        );

        let api_rx = self.api_session.start()?;
        tokio::spawn(FrameRouter::for_api("api", Arc::clone(&self.registry)).run(api_rx));

        self.spawn_status_probe();
        Ok(())
    }

    /// API 会话首次打开后探测一次 NapCat 状态
    fn spawn_status_probe(&self) {
        let mut state = self.api_session.subscribe();
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            let opened = state
                .wait_for(|s| matches!(s, SessionState::Open | SessionState::Stopped))
                .await
                .map(|s| *s == SessionState::Open)
                .unwrap_or(false);
            if opened && api.get_status().await {
                tracing::info!("NapCat API 连接正常");
            }
        });
    }

    /// 按固定顺序释放资源，单步失败不影响后续步骤
    pub async fn stop(&self) {
        tracing::info!("正在关闭服务...");
        let mut coordinator = ShutdownCoordinator::new();
        coordinator.register(SessionsCleanup {
            sessions: vec![self.event_session.clone(), self.api_session.clone()],
        });
        coordinator.register(PendingRequestsCleanup {
            registry: Arc::clone(&self.registry),
        });
        coordinator.register(RendererCleanup {
            renderer: Arc::clone(&self.renderer),
        });
        coordinator.run_cleanup().await;
        tracing::info!("服务已关闭");
    }
}

struct SessionsCleanup {
    sessions: Vec<Arc<TransportSession>>,
}

#[async_trait::async_trait]
impl ShutdownCleanup for SessionsCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        for session in &self.sessions {
            session.stop();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sessions"
    }
}

struct PendingRequestsCleanup {
    registry: Arc<CorrelationRegistry>,
}

#[async_trait::async_trait]
impl ShutdownCleanup for PendingRequestsCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let failed = self.registry.fail_all();
        if failed > 0 {
            tracing::info!(failed, "未完成的请求已取消");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "pending-requests"
    }
}

struct RendererCleanup {
    renderer: Arc<ChromeRenderer>,
}

#[async_trait::async_trait]
impl ShutdownCleanup for RendererCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.renderer.destroy().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "renderer"
    }
}
