//! CQ 码解析：raw_message 中内嵌的 `[CQ:类型,键=值,...]` 标签
//!
//! 只做两件事：找出标签（回复、@、图片、其他），以及从文本中剥离指定种类的标签。
//! 标签不嵌套；残缺或格式错误的标签原样保留，解析永不失败。

use std::sync::OnceLock;

use regex::Regex;

/// 内嵌标签
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddedTag {
    /// `[CQ:reply,id=123]`
    Reply { target_message_id: i64 },
    /// `[CQ:at,qq=456]`
    Mention { target_user_id: i64 },
    /// `[CQ:image,file=...,url=...]`，优先取 url
    Image { uri: String },
    /// 其他已识别但不关心的标签（含 `qq=all` 之类非数字目标）
    Other { raw: String },
}

/// 标签及其在原文中的字节区间 `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSpan {
    pub start: usize,
    pub end: usize,
    pub tag: EmbeddedTag,
}

const TAG_OPEN: &str = "[CQ:";

/// 格式正确的标签：类型只含字母数字下划线，每个参数都是 `键=值`，参数里不出现方括号
fn tag_regex() -> Option<&'static Regex> {
    static TAG_RE: OnceLock<Option<Regex>> = OnceLock::new();
    TAG_RE
        .get_or_init(|| {
            Regex::new(r"\[CQ:([A-Za-z0-9_]+)((?:,[^,=\[\]]+=[^,\[\]]*)*)\]")
                .map_err(|e| tracing::error!(error = %e, "CQ 标签正则编译失败"))
                .ok()
        })
        .as_ref()
}

/// 扫描文本中全部格式正确的标签；残缺的标签不匹配，原样留在文本里
pub fn parse_tags(text: &str) -> Vec<TagSpan> {
    let Some(re) = tag_regex() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let kind = caps.get(1)?.as_str();
            let params = caps.get(2).map_or("", |m| m.as_str());
            Some(TagSpan {
                start: whole.start(),
                end: whole.end(),
                tag: to_tag(kind, params, whole.as_str()),
            })
        })
        .collect()
}

fn to_tag(kind: &str, params: &str, raw: &str) -> EmbeddedTag {
    let params: Vec<(&str, String)> = params
        .split(',')
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k, unescape(v)))
        .collect();
    let param = |name: &str| {
        params
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    };
    let other = || EmbeddedTag::Other {
        raw: raw.to_string(),
    };

    match kind {
        "reply" => match param("id").and_then(|v| v.parse::<i64>().ok()) {
            Some(id) => EmbeddedTag::Reply {
                target_message_id: id,
            },
            None => other(),
        },
        "at" => match param("qq").and_then(|v| v.parse::<i64>().ok()) {
            Some(qq) => EmbeddedTag::Mention { target_user_id: qq },
            None => other(),
        },
        "image" => match param("url").or_else(|| param("file")).filter(|v| !v.is_empty()) {
            Some(uri) => EmbeddedTag::Image {
                uri: uri.to_string(),
            },
            None => other(),
        },
        _ => other(),
    }
}

/// CQ 码参数值反转义
fn unescape(value: &str) -> String {
    value
        .replace("&#44;", ",")
        .replace("&#91;", "[")
        .replace("&#93;", "]")
        .replace("&amp;", "&")
}

/// 移除满足条件的标签，直到文本中不再出现此类标签（移除后可能拼出新标签）
fn strip_matching(text: &str, matches: impl Fn(&EmbeddedTag) -> bool) -> String {
    let mut current = text.to_string();
    loop {
        let spans: Vec<TagSpan> = parse_tags(&current)
            .into_iter()
            .filter(|s| matches(&s.tag))
            .collect();
        if spans.is_empty() {
            return current;
        }

        let mut out = String::with_capacity(current.len());
        let mut last = 0;
        for span in &spans {
            out.push_str(&current[last..span.start]);
            last = span.end;
        }
        out.push_str(&current[last..]);
        current = out;
    }
}

/// 提取首个回复标签的目标消息 ID，并移除全部回复标签
pub fn extract_reply(text: &str) -> (String, Option<i64>) {
    let target = parse_tags(text).into_iter().find_map(|s| match s.tag {
        EmbeddedTag::Reply { target_message_id } => Some(target_message_id),
        _ => None,
    });
    let clean = strip_matching(text, |t| matches!(t, EmbeddedTag::Reply { .. }));
    (clean.trim().to_string(), target)
}

/// 判断首个 @ 是否指向机器人自身，并移除全部 @ 标签
pub fn extract_mention(text: &str, self_id: i64) -> (String, bool) {
    let addressed = parse_tags(text)
        .into_iter()
        .find_map(|s| match s.tag {
            EmbeddedTag::Mention { target_user_id } => Some(target_user_id),
            _ => None,
        })
        .is_some_and(|target| target == self_id);
    let clean = strip_matching(text, |t| matches!(t, EmbeddedTag::Mention { .. }));
    (clean.trim().to_string(), addressed)
}

/// 首个图片标签的来源
pub fn first_image(text: &str) -> Option<String> {
    parse_tags(text).into_iter().find_map(|s| match s.tag {
        EmbeddedTag::Image { uri } => Some(uri),
        _ => None,
    })
}

/// 去掉所有已识别标签后的纯文本（用于引用内容展示）
pub fn plain_text(text: &str) -> String {
    strip_matching(text, |_| true).trim().to_string()
}

/// 文本中是否含有任何 CQ 标签开头（Markdown 检测的前置守卫用）
pub fn contains_tag(text: &str) -> bool {
    text.contains(TAG_OPEN)
}
