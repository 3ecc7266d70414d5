use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};

use crate::formats::{CatalogFile, Chapter};

/// Every known chapter, ascending by chapter number with no duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Catalog {
    pub updated_at: Option<DateTime<Utc>>,
    chapters: Vec<Chapter>,
}

impl Catalog {
    /// Sorts by chapter number; for duplicate numbers the later entry wins.
    pub fn new(updated_at: Option<DateTime<Utc>>, chapters: Vec<Chapter>) -> Self {
        let input_len = chapters.len();
        let by_num = chapters
            .into_iter()
            .map(|chapter| (chapter.chapter_num, chapter))
            .collect::<BTreeMap<_, _>>();
        if by_num.len() != input_len {
            tracing::warn!(
                duplicates = input_len - by_num.len(),
                "catalog had duplicate chapter numbers; keeping the last of each"
            );
        }
        Self {
            updated_at,
            chapters: by_num.into_values().collect(),
        }
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn into_chapters(self) -> Vec<Chapter> {
        self.chapters
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn max_chapter_num(&self) -> Option<u32> {
        self.chapters.last().map(|chapter| chapter.chapter_num)
    }

    pub fn to_file(&self) -> CatalogFile {
        let updated_at = self.updated_at.unwrap_or_else(Utc::now);
        CatalogFile {
            update_timestamp: updated_at.timestamp_millis(),
            update_time_formatted: updated_at
                .with_timezone(&Local)
                .format("%Y/%m/%d %H:%M:%S")
                .to_string(),
            chapters_length: self.chapters.len(),
            chapters: self.chapters.clone(),
        }
    }

    pub fn from_file(file: CatalogFile) -> Self {
        let updated_at = DateTime::from_timestamp_millis(file.update_timestamp);
        Self::new(updated_at, file.chapters)
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// `Ok(None)` when nothing has been persisted yet.
    async fn load(&self) -> anyhow::Result<Option<Catalog>>;
    /// Always called with the full merged catalog, never a partial diff.
    async fn save(&self, catalog: &Catalog) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct LocalFsCatalogStore {
    path: PathBuf,
}

impl LocalFsCatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CatalogStore for LocalFsCatalogStore {
    async fn load(&self) -> anyhow::Result<Option<Catalog>> {
        let file: Option<CatalogFile> = crate::fsio::read_json(&self.path)
            .await
            .with_context(|| format!("read catalog: {}", self.path.display()))?;
        Ok(file.map(Catalog::from_file))
    }

    async fn save(&self, catalog: &Catalog) -> anyhow::Result<()> {
        crate::fsio::write_json_atomic(&self.path, &catalog.to_file())
            .await
            .with_context(|| format!("write catalog: {}", self.path.display()))?;
        tracing::info!(
            path = %self.path.display(),
            chapters = catalog.len(),
            "saved catalog"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::Page;

    fn chapter(num: u32, pages: u32) -> Chapter {
        Chapter {
            chapter_num: num,
            title: format!("Chapter {num}"),
            url: format!("https://example.com/cn/chapters.html?chapter={num}"),
            pages: (1..=pages)
                .map(|page_num| Page {
                    page_num,
                    url: format!("https://example.com/cn/page-{page_num}.html"),
                })
                .collect(),
        }
    }

    #[test]
    fn new_sorts_and_dedups_by_chapter_num() {
        let mut stale_two = chapter(2, 1);
        stale_two.title = "stale".to_string();
        let catalog = Catalog::new(
            None,
            vec![chapter(3, 1), stale_two, chapter(1, 1), chapter(2, 4)],
        );

        let nums = catalog
            .chapters()
            .iter()
            .map(|c| c.chapter_num)
            .collect::<Vec<_>>();
        assert_eq!(nums, vec![1, 2, 3]);
        assert_eq!(catalog.chapters()[1].pages.len(), 4);
        assert_eq!(catalog.max_chapter_num(), Some(3));
    }

    #[test]
    fn empty_catalog_has_no_max() {
        assert_eq!(Catalog::default().max_chapter_num(), None);
    }

    #[test]
    fn to_file_derives_chapters_length() {
        let catalog = Catalog::new(Some(Utc::now()), vec![chapter(1, 2), chapter(2, 3)]);
        let file = catalog.to_file();
        assert_eq!(file.chapters_length, 2);
        assert_eq!(file.chapters.len(), 2);
        assert!(!file.update_time_formatted.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsCatalogStore::new(temp.path().join("details.json"));
        assert!(store.load().await?.is_none());

        let updated_at = DateTime::from_timestamp_millis(1_700_000_000_123);
        let catalog = Catalog::new(updated_at, vec![chapter(7, 3), chapter(5, 2)]);
        store.save(&catalog).await?;

        let loaded = store.load().await?.expect("catalog saved");
        assert_eq!(loaded, catalog);
        Ok(())
    }

    #[tokio::test]
    async fn load_rejects_corrupt_json() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("details.json");
        std::fs::write(&path, b"{ not json")?;
        let err = LocalFsCatalogStore::new(&path).load().await.unwrap_err();
        assert!(format!("{err:#}").contains("read catalog"));
        Ok(())
    }
}
