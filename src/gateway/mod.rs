//! NapCat 网关客户端
//!
//! 两条独立的 WebSocket 会话（事件流 / API 调用）共用同一套重连策略：
//!
//! - **session**：单条连接的生命周期（建连、Bearer 认证、接收循环、定时重连、stop）
//! - **registry**：echo 关联表，请求 ↔ 响应配对、超时、断线清理
//! - **frame**：事件帧 / 请求帧 / 响应帧的编解码与归一化
//! - **router**：每帧先交给关联表，否则交给事件处理者
//! - **api**：出站消息（send_group_msg）与引用消息查询（get_msg）

mod api;
mod frame;
mod registry;
mod router;
mod session;

pub use api::{
    ContentKind, GatewayApi, MessageSegment, NapCatApi, OutboundAction, ReferencedMessage,
};
pub use frame::{parse_frame, EventKind, Frame, InboundEvent, RequestFrame, RpcResponse, SenderInfo};
pub use registry::{CorrelationRegistry, FrameWriter, DEFAULT_REQUEST_TIMEOUT};
pub use router::{EventSink, FrameRouter};
pub use session::{SessionConfig, SessionEvent, SessionState, TransportSession};
