//! 事件分类：只放行监控目标的群消息，并决定走哪条处理分支
//!
//! 纯过滤器，被拒绝的事件直接丢弃，没有任何副作用。

use std::fmt;

use serde::Deserialize;

use crate::cq;
use crate::gateway::InboundEvent;

/// 监控目标：`user_id` 为空时匹配群内任何人
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MonitoredTarget {
    pub group_id: i64,
    #[serde(default)]
    pub user_id: Option<i64>,
}

impl MonitoredTarget {
    pub fn matches(&self, group_id: i64, user_id: i64) -> bool {
        self.group_id == group_id && self.user_id.map_or(true, |u| u == user_id)
    }
}

impl fmt::Display for MonitoredTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.user_id {
            Some(user) => write!(f, "群组 {} 中用户 {}", self.group_id, user),
            None => write!(f, "群组 {} 中所有人", self.group_id),
        }
    }
}

/// 处理分支
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// @ 了机器人自己
    DirectAddress,
    /// 普通消息，只在含 Markdown 时处理
    Content,
}

/// 被放行的事件
#[derive(Debug, Clone)]
pub struct Admitted {
    pub group_id: i64,
    pub route: Route,
    pub event: InboundEvent,
}

pub struct EventClassifier {
    targets: Vec<MonitoredTarget>,
}

impl EventClassifier {
    pub fn new(targets: Vec<MonitoredTarget>) -> Self {
        Self { targets }
    }

    pub fn targets(&self) -> &[MonitoredTarget] {
        &self.targets
    }

    pub fn is_monitored(&self, group_id: i64, user_id: i64) -> bool {
        self.targets.iter().any(|t| t.matches(group_id, user_id))
    }

    /// 放行则返回分支，否则 None
    pub fn classify(&self, event: InboundEvent) -> Option<Admitted> {
        let group_id = event.group_message_id()?;
        if !self.is_monitored(group_id, event.user_id) {
            tracing::trace!(group_id, user_id = event.user_id, "非监控目标，忽略");
            return None;
        }

        let (_, addressed) = cq::extract_mention(&event.raw_text, event.self_id);
        let route = if addressed {
            Route::DirectAddress
        } else {
            Route::Content
        };
        Some(Admitted {
            group_id,
            route,
            event,
        })
    }
}
