use std::path::{Path, PathBuf};

use anyhow::Context as _;

pub const CATALOG_FILE_NAME: &str = "details.json";
pub const MARKER_FILE_NAME: &str = "meta.json";
pub const PDF_DIR_NAME: &str = "pdf";

const CHAPTER_DIR_PREFIX: &str = "Chapter-";

/// Where everything lives under the workspace root:
///
/// ```text
/// <root>/details.json
/// <root>/chapters/Chapter-<n>/meta.json
/// <root>/chapters/Chapter-<n>/Page-<pageNum>.jpg
/// <root>/chapters/pdf/<sanitized title>.pdf
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterDir {
    pub chapter_num: u32,
    pub path: PathBuf,
}

impl ChapterDir {
    pub fn marker_path(&self) -> PathBuf {
        self.path.join(MARKER_FILE_NAME)
    }
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_FILE_NAME)
    }

    pub fn chapters_dir(&self) -> PathBuf {
        self.root.join("chapters")
    }

    pub fn chapter_dir(&self, chapter_num: u32) -> ChapterDir {
        ChapterDir {
            chapter_num,
            path: self
                .chapters_dir()
                .join(format!("{CHAPTER_DIR_PREFIX}{chapter_num}")),
        }
    }

    pub fn pdf_dir(&self) -> PathBuf {
        self.chapters_dir().join(PDF_DIR_NAME)
    }

    pub fn pdf_path(&self, title: &str) -> PathBuf {
        self.pdf_dir()
            .join(format!("{}.pdf", sanitize_file_name(title)))
    }

    /// Chapter directories present on disk, ascending by chapter number.
    /// Entries that are not `Chapter-<n>` directories are ignored.
    pub async fn list_chapter_dirs(&self) -> anyhow::Result<Vec<ChapterDir>> {
        let chapters_dir = self.chapters_dir();
        let mut entries = match tokio::fs::read_dir(&chapters_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read chapters dir: {}", chapters_dir.display()));
            }
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("read chapters dir: {}", chapters_dir.display()))?
        {
            let file_type = entry.file_type().await?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(chapter_num) = name.to_str().and_then(parse_chapter_dir_name) else {
                continue;
            };
            dirs.push(ChapterDir {
                chapter_num,
                path: entry.path(),
            });
        }
        dirs.sort_by_key(|dir| dir.chapter_num);
        Ok(dirs)
    }
}

pub fn page_image_file_name(page_num: u32) -> String {
    format!("Page-{page_num}.jpg")
}

pub fn parse_chapter_dir_name(name: &str) -> Option<u32> {
    name.strip_prefix(CHAPTER_DIR_PREFIX)?.parse().ok()
}

/// Replaces path-unsafe characters and whitespace with `-`, collapsing runs.
pub fn sanitize_file_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        let unsafe_char = matches!(ch, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
            || ch.is_whitespace();
        let ch = if unsafe_char { '-' } else { ch };
        if ch == '-' && out.ends_with('-') {
            continue;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_chars_and_collapses_separators() {
        let name = sanitize_file_name("Chapter 1: A/B?");
        assert_eq!(name, "Chapter-1-A-B-");
        for bad in ['/', ':', '?', ' '] {
            assert!(!name.contains(bad), "{name:?} contains {bad:?}");
        }
        assert!(!name.contains("--"));
    }

    #[test]
    fn sanitize_keeps_unicode_titles() {
        assert_eq!(sanitize_file_name("第 12 话\t终章"), "第-12-话-终章");
        assert_eq!(sanitize_file_name("a--b"), "a-b");
    }

    #[test]
    fn chapter_dir_names_round_trip() {
        let layout = Layout::new("results");
        let dir = layout.chapter_dir(42);
        let name = dir.path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "Chapter-42");
        assert_eq!(parse_chapter_dir_name(name), Some(42));
        assert_eq!(parse_chapter_dir_name("pdf"), None);
        assert_eq!(parse_chapter_dir_name("Chapter-x"), None);
    }

    #[test]
    fn pdf_path_lives_under_chapters_pdf() {
        let layout = Layout::new("results");
        assert_eq!(
            layout.pdf_path("Chapter 1: A/B?"),
            PathBuf::from("results/chapters/pdf/Chapter-1-A-B-.pdf")
        );
    }

    #[tokio::test]
    async fn list_chapter_dirs_sorts_numerically_and_skips_others() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let layout = Layout::new(temp.path());
        for name in ["Chapter-10", "Chapter-9", "Chapter-1", "pdf", "notes"] {
            std::fs::create_dir_all(layout.chapters_dir().join(name))?;
        }
        std::fs::write(layout.chapters_dir().join(".DS_Store"), b"")?;

        let nums = layout
            .list_chapter_dirs()
            .await?
            .into_iter()
            .map(|dir| dir.chapter_num)
            .collect::<Vec<_>>();
        assert_eq!(nums, vec![1, 9, 10]);
        Ok(())
    }

    #[tokio::test]
    async fn list_chapter_dirs_without_chapters_dir_is_empty() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let layout = Layout::new(temp.path().join("missing"));
        assert!(layout.list_chapter_dirs().await?.is_empty());
        Ok(())
    }
}
