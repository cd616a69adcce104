//! napbot 入口：初始化日志、加载配置、启动渲染器与两条 NapCat 会话，收到 Ctrl+C / SIGTERM 后有序关闭。
//!
//! 用法：`napbot [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use napbot::core::ShutdownManager;
use napbot::{load_config, observability, Bot};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("加载配置失败")?;
    config.validate().context("配置校验失败")?;

    let bot = Bot::new(config).context("创建机器人失败")?;
    bot.init_renderer().await.context("启动服务失败")?;
    if let Err(e) = bot.start() {
        bot.stop().await;
        return Err(e).context("启动服务失败");
    }

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let reason = shutdown.wait_for_shutdown().await;
    tracing::info!(?reason, "开始关闭");

    bot.stop().await;
    Ok(())
}
