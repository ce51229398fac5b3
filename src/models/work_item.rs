use serde::{Deserialize, Serialize};
use std::path::Path;

/// 仓库树中的条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Blob,
    Tree,
    Commit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Blob => "blob",
            EntryType::Tree => "tree",
            EntryType::Commit => "commit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "blob" => Some(EntryType::Blob),
            "tree" => Some(EntryType::Tree),
            "commit" => Some(EntryType::Commit),
            _ => None,
        }
    }
}

/// 仓库树条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub sha: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
}

/// 待翻译的单个文件
///
/// 在批处理开始时由仓库树构建，运行期间不可变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// 仓库内路径，同时作为缓存键
    pub path: String,
    pub content: String,
    /// 源文件 blob 的 sha
    pub sha: String,
    /// 文件名（仅用于展示）
    pub filename: String,
}

impl WorkItem {
    pub fn new(path: impl Into<String>, content: impl Into<String>, sha: impl Into<String>) -> Self {
        let path = path.into();
        let filename = Path::new(&path)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.clone());
        Self {
            path,
            content: content.into(),
            sha: sha.into(),
            filename,
        }
    }

    /// 该文件所在目录（报告分组用），根目录返回 "."
    pub fn directory(&self) -> String {
        directory_of(&self.path)
    }
}

pub(crate) fn directory_of(path: &str) -> String {
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().to_string(),
        _ => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_and_directory() {
        let item = WorkItem::new("docs/guide/intro.md", "# Hi", "abc");
        assert_eq!(item.filename, "intro.md");
        assert_eq!(item.directory(), "docs/guide");

        let root = WorkItem::new("README.md", "", "def");
        assert_eq!(root.directory(), ".");
    }

    #[test]
    fn test_entry_type_round_trip() {
        for t in [EntryType::Blob, EntryType::Tree, EntryType::Commit] {
            assert_eq!(EntryType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EntryType::parse("symlink"), None);
    }
}
