//! Markdown 保护
//!
//! front matter 和围栏代码块在送去翻译前替换为占位符，翻译后再原样放回。

use regex::Regex;

use crate::error::{AppError, AppResult};

/// 替换掉受保护片段后的文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protected {
    pub text: String,
    pub fragments: Vec<String>,
}

impl Protected {
    /// 去掉占位符后剩下的正文，用于语言检测
    pub fn prose(&self, guard: &MarkdownGuard) -> String {
        guard.placeholder.replace_all(&self.text, "").into_owned()
    }
}

pub struct MarkdownGuard {
    placeholder: Regex,
}

fn placeholder(index: usize) -> String {
    format!("<!-- keep:{} -->", index)
}

/// 围栏标记：三个以上的 ` 或 ~
fn fence_marker(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let ch = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = trimmed.chars().take_while(|c| *c == ch).count();
    (len >= 3).then(|| &trimmed[..len])
}

fn closes_fence(line: &str, opening: &str) -> bool {
    match fence_marker(line) {
        Some(marker) => {
            marker.starts_with(&opening[..1])
                && marker.len() >= opening.len()
                && line.trim_start()[marker.len()..].trim().is_empty()
        }
        None => false,
    }
}

impl MarkdownGuard {
    pub fn new() -> AppResult<Self> {
        let placeholder = Regex::new(r"<!--\s*keep:(\d+)\s*-->").map_err(AppError::unknown)?;
        Ok(Self { placeholder })
    }

    pub fn protect(&self, content: &str) -> Protected {
        let mut text = String::with_capacity(content.len());
        let mut fragments = Vec::new();
        let mut lines = content.split_inclusive('\n').peekable();

        // front matter 只能出现在第一行
        if lines.peek().map(|l| l.trim_end() == "---").unwrap_or(false) {
            let mut block = String::new();
            let mut closed = false;
            if let Some(first) = lines.next() {
                block.push_str(first);
            }
            for line in lines.by_ref() {
                block.push_str(line);
                if line.trim_end() == "---" {
                    closed = true;
                    break;
                }
            }
            if closed {
                push_fragment(&mut text, &mut fragments, block);
            } else {
                // 没有闭合就不是 front matter
                text.push_str(&block);
            }
        }

        while let Some(line) = lines.next() {
            let Some(opening) = fence_marker(line) else {
                text.push_str(line);
                continue;
            };
            let opening = opening.to_string();
            let mut block = line.to_string();
            for inner in lines.by_ref() {
                block.push_str(inner);
                if closes_fence(inner, &opening) {
                    break;
                }
            }
            push_fragment(&mut text, &mut fragments, block);
        }

        Protected { text, fragments }
    }

    /// 把占位符换回原文；缺少任何一个占位符都视为校验错误
    pub fn restore(&self, translated: &str, protected: &Protected) -> AppResult<String> {
        let mut seen = vec![false; protected.fragments.len()];
        for caps in self.placeholder.captures_iter(translated) {
            if let Some(index) = caps[1].parse::<usize>().ok().filter(|i| *i < seen.len()) {
                seen[index] = true;
            }
        }
        if let Some(missing) = seen.iter().position(|s| !s) {
            return Err(AppError::Validation(format!(
                "译文缺少占位符 {}（共 {} 个受保护片段）",
                placeholder(missing),
                protected.fragments.len()
            )));
        }

        let restored = self.placeholder.replace_all(translated, |caps: &regex::Captures| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|i| protected.fragments.get(i))
                .map(|fragment| fragment.strip_suffix('\n').unwrap_or(fragment).to_string())
                .unwrap_or_else(|| caps[0].to_string())
        });
        Ok(restored.into_owned())
    }
}

fn push_fragment(text: &mut String, fragments: &mut Vec<String>, block: String) {
    text.push_str(&placeholder(fragments.len()));
    if block.ends_with('\n') {
        text.push('\n');
    }
    fragments.push(block);
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "---\ntitle: Intro\n---\n# Getting started\n\nRun this:\n\n```bash\nnpm install\n```\n\nThen ~~~ is fine inline.\n\n~~~~js\nconst a = '```';\n~~~~\nDone.\n";

    #[test]
    fn test_protect_front_matter_and_fences() {
        let guard = MarkdownGuard::new().unwrap();
        let protected = guard.protect(DOC);
        assert_eq!(protected.fragments.len(), 3);
        assert_eq!(protected.fragments[0], "---\ntitle: Intro\n---\n");
        assert_eq!(protected.fragments[1], "```bash\nnpm install\n```\n");
        assert!(protected.fragments[2].contains("const a = '```';"));
        assert!(!protected.text.contains("npm install"));
        assert!(protected.text.contains("# Getting started"));

        let prose = protected.prose(&guard);
        assert!(!prose.contains("keep:"));
        assert!(prose.contains("Run this:"));
    }

    #[test]
    fn test_restore_is_verbatim() {
        let guard = MarkdownGuard::new().unwrap();
        let protected = guard.protect(DOC);
        let translated = protected
            .text
            .replace("Getting started", "Начало работы")
            .replace("<!-- keep:1 -->", "<!--keep:1-->");
        let restored = guard.restore(&translated, &protected).unwrap();
        assert!(restored.starts_with("---\ntitle: Intro\n---\n# Начало работы"));
        assert!(restored.contains("```bash\nnpm install\n```\n"));
        assert!(restored.contains("~~~~js\nconst a = '```';\n~~~~\n"));
    }

    #[test]
    fn test_missing_placeholder_is_validation_error() {
        let guard = MarkdownGuard::new().unwrap();
        let protected = guard.protect(DOC);
        let translated = protected.text.replace("<!-- keep:2 -->", "");
        let err = guard.restore(&translated, &protected).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_unclosed_front_matter_is_text() {
        let guard = MarkdownGuard::new().unwrap();
        let protected = guard.protect("---\nnot front matter\n");
        assert!(protected.fragments.is_empty());
        assert_eq!(protected.text, "---\nnot front matter\n");
    }
}
