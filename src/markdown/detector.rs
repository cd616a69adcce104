//! Markdown 特征检测
//!
//! 有序的 (正则, 特征) 表，全部求值以报告所有命中的特征；含 CQ 标签的文本一律视为非 Markdown。

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::cq;

/// 检测到的 Markdown 特征
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkdownFeature {
    Heading,
    Bold,
    Italic,
    Strikethrough,
    CodeBlock,
    InlineCode,
    Link,
    Image,
    UnorderedList,
    OrderedList,
    Blockquote,
    Table,
    HorizontalRule,
}

impl fmt::Display for MarkdownFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MarkdownFeature::Heading => "heading",
            MarkdownFeature::Bold => "bold",
            MarkdownFeature::Italic => "italic",
            MarkdownFeature::Strikethrough => "strikethrough",
            MarkdownFeature::CodeBlock => "code_block",
            MarkdownFeature::InlineCode => "inline_code",
            MarkdownFeature::Link => "link",
            MarkdownFeature::Image => "image",
            MarkdownFeature::UnorderedList => "unordered_list",
            MarkdownFeature::OrderedList => "ordered_list",
            MarkdownFeature::Blockquote => "blockquote",
            MarkdownFeature::Table => "table",
            MarkdownFeature::HorizontalRule => "horizontal_rule",
        };
        write!(f, "{}", name)
    }
}

/// 检测结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub features: Vec<MarkdownFeature>,
}

impl Detection {
    pub fn is_markdown(&self) -> bool {
        !self.features.is_empty()
    }

    pub fn contains(&self, feature: MarkdownFeature) -> bool {
        self.features.contains(&feature)
    }

    /// 日志用：`bold, link`
    pub fn describe(&self) -> String {
        self.features
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

const PATTERNS: &[(&str, MarkdownFeature)] = &[
    (r"(?m)^\s{0,3}#{1,6}\s+\S", MarkdownFeature::Heading),
    (r"\*\*[^*\n]+\*\*", MarkdownFeature::Bold),
    (r"(?:^|[^*])\*[^*\s][^*\n]*\*(?:[^*]|$)", MarkdownFeature::Italic),
    (r"~~[^~\n]+~~", MarkdownFeature::Strikethrough),
    (r"(?s)```.*?```", MarkdownFeature::CodeBlock),
    (r"`[^`\n]+`", MarkdownFeature::InlineCode),
    (r"(?:^|[^!])\[[^\]]+\]\([^)]+\)", MarkdownFeature::Link),
    (r"!\[[^\]]*\]\([^)]+\)", MarkdownFeature::Image),
    (r"(?m)^\s*[-*+]\s+\S", MarkdownFeature::UnorderedList),
    (r"(?m)^\s*\d+\.\s+\S", MarkdownFeature::OrderedList),
    (r"(?m)^\s*>\s+", MarkdownFeature::Blockquote),
    (r"(?m)^\s*\|.*\|.*\|", MarkdownFeature::Table),
    (r"(?m)^\s*---+\s*$", MarkdownFeature::HorizontalRule),
];

fn compiled() -> &'static [(Regex, MarkdownFeature)] {
    static TABLE: OnceLock<Vec<(Regex, MarkdownFeature)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        PATTERNS
            .iter()
            .filter_map(|(pattern, feature)| match Regex::new(pattern) {
                Ok(re) => Some((re, *feature)),
                Err(e) => {
                    tracing::error!(pattern, error = %e, "Markdown 规则编译失败");
                    None
                }
            })
            .collect()
    })
}

/// 检测文本中的 Markdown 特征
pub fn detect(text: &str) -> Detection {
    if text.trim().is_empty() || cq::contains_tag(text) {
        return Detection::default();
    }

    let features = compiled()
        .iter()
        .filter(|(re, _)| re.is_match(text))
        .map(|(_, feature)| *feature)
        .collect();
    Detection { features }
}

pub fn is_markdown(text: &str) -> bool {
    detect(text).is_markdown()
}
