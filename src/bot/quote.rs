//! 引用消息解析：通过 get_msg 取回被回复的消息，文本转成上下文说明，图片下载后内联
//!
//! 任何一步失败都只降级为一段「无法获取」的说明，不会中断流水线。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;

use crate::core::MediaError;
use crate::gateway::{ContentKind, GatewayApi};

/// 图片获取
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, MediaError>;
}

/// 单张引用图片的下载上限
pub const MAX_MEDIA_BYTES: usize = 10 * 1024 * 1024;

/// `base64://` 直接解码，`http(s)` 用 reqwest 下载
pub struct HttpMediaFetcher {
    http: reqwest::Client,
    max_bytes: usize,
}

impl HttpMediaFetcher {
    pub fn new(timeout: Duration) -> Result<Self, MediaError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MediaError::Download(e.to_string()))?;
        Ok(Self {
            http,
            max_bytes: MAX_MEDIA_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn too_large(&self) -> MediaError {
        MediaError::Download(format!("图片超过 {} 字节上限", self.max_bytes))
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, MediaError> {
        if let Some(payload) = uri.strip_prefix("base64://") {
            return base64::engine::general_purpose::STANDARD
                .decode(payload.trim())
                .map_err(|e| MediaError::Decode(e.to_string()));
        }
        if !(uri.starts_with("http://") || uri.starts_with("https://")) {
            return Err(MediaError::UnsupportedSource(uri.to_string()));
        }

        let mut response = self
            .http
            .get(uri)
            .send()
            .await
            .map_err(|e| MediaError::Download(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MediaError::Download(format!("HTTP {}", status)));
        }
        // Content-Length 可能缺失或不可信，读取时仍按累计长度截断
        if response
            .content_length()
            .is_some_and(|len| len > self.max_bytes as u64)
        {
            return Err(self.too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| MediaError::Download(e.to_string()))?
        {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(self.too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// 按文件头猜 MIME，认不出时按 JPEG 处理
pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

/// 引用解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteContext {
    /// 放在提示最前面的上下文说明
    pub header: String,
    /// 内联图片：(mime, bytes)
    pub attachment: Option<(String, Vec<u8>)>,
}

pub struct QuoteResolver {
    api: Arc<dyn GatewayApi>,
    media: Arc<dyn MediaFetcher>,
    unavailable_text: String,
}

impl QuoteResolver {
    pub fn new(
        api: Arc<dyn GatewayApi>,
        media: Arc<dyn MediaFetcher>,
        unavailable_text: impl Into<String>,
    ) -> Self {
        Self {
            api,
            media,
            unavailable_text: unavailable_text.into(),
        }
    }

    fn unavailable(&self) -> QuoteContext {
        QuoteContext {
            header: self.unavailable_text.clone(),
            attachment: None,
        }
    }

    pub async fn resolve(&self, message_id: i64) -> QuoteContext {
        let quoted = match self.api.get_msg(message_id).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(message_id, error = %e, "获取引用消息失败");
                return self.unavailable();
            }
        };

        match quoted.content_kind {
            ContentKind::Text => QuoteContext {
                header: format!("[{} 说]: {}", quoted.sender_nickname, quoted.content),
                attachment: None,
            },
            ContentKind::Image => match self.media.fetch(&quoted.content).await {
                Ok(bytes) => {
                    let mime = sniff_mime(&bytes);
                    tracing::debug!(message_id, mime, size = bytes.len(), "引用图片已获取");
                    QuoteContext {
                        header: format!("[{} 发送了一张图片]", quoted.sender_nickname),
                        attachment: Some((mime.to_string(), bytes)),
                    }
                }
                Err(e) => {
                    tracing::warn!(message_id, error = %e, "引用图片获取失败");
                    QuoteContext {
                        header: format!(
                            "[{} 发送了一张图片] {}",
                            quoted.sender_nickname, self.unavailable_text
                        ),
                        attachment: None,
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_mime() {
        assert_eq!(sniff_mime(&[0x89, b'P', b'N', b'G', 0x0d]), "image/png");
        assert_eq!(sniff_mime(b"GIF89a..."), "image/gif");
        assert_eq!(sniff_mime(&[0xff, 0xd8, 0xff]), "image/jpeg");
        assert_eq!(sniff_mime(&[]), "image/jpeg");
    }

    #[tokio::test]
    async fn test_http_fetcher_decodes_base64_and_rejects_files() {
        let fetcher = HttpMediaFetcher::new(Duration::from_secs(1)).unwrap();
        assert_eq!(fetcher.fetch("base64://iVBORw==").await.unwrap(), vec![0x89, b'P', b'N', b'G']);
        assert!(matches!(
            fetcher.fetch("base64://@@@").await,
            Err(MediaError::Decode(_))
        ));
        assert!(matches!(
            fetcher.fetch("file:///tmp/a.jpg").await,
            Err(MediaError::UnsupportedSource(_))
        ));
    }

    /// 本地起一个只应答一次的 HTTP 服务，返回图片地址
    async fn serve_once(content_length: bool, body: Vec<u8>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let mut head = String::from("HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nConnection: close\r\n");
            if content_length {
                head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
            head.push_str("\r\n");
            // 客户端可能提前断开，写失败无所谓
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(&body).await;
            let _ = stream.shutdown().await;
        });
        format!("http://{}/a.png", addr)
    }

    #[tokio::test]
    async fn test_http_download_within_limit() {
        let url = serve_once(true, vec![7u8; 512]).await;
        let fetcher = HttpMediaFetcher::new(Duration::from_secs(5))
            .unwrap()
            .with_max_bytes(1024);
        assert_eq!(fetcher.fetch(&url).await.unwrap(), vec![7u8; 512]);
    }

    #[tokio::test]
    async fn test_http_download_over_limit_is_rejected() {
        let fetcher = HttpMediaFetcher::new(Duration::from_secs(5))
            .unwrap()
            .with_max_bytes(1024);

        // 声明了 Content-Length 的直接拒绝
        let url = serve_once(true, vec![0u8; 4096]).await;
        assert!(matches!(fetcher.fetch(&url).await, Err(MediaError::Download(_))));

        // 没有 Content-Length 时按累计长度拒绝
        let url = serve_once(false, vec![0u8; 4096]).await;
        assert!(matches!(fetcher.fetch(&url).await, Err(MediaError::Download(_))));
    }
}
