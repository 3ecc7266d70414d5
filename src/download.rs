use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use url::Url;

use crate::error::Error;
use crate::extract::Extractor;
use crate::formats::{Chapter, Page};
use crate::layout::{ChapterDir, Layout, MARKER_FILE_NAME, page_image_file_name};
use crate::pool::ConcurrencyPolicy;
use crate::transport::Transport;

/// Download progress of a chapter, derived from the filesystem alone so a
/// killed run resumes where it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterState {
    /// No chapter directory.
    Unstarted,
    /// Directory exists, completion marker does not.
    InProgress,
    /// Completion marker written after every image landed.
    Complete { marker: PathBuf },
}

impl ChapterState {
    pub fn derive(dir: &ChapterDir, dir_exists: bool, marker_exists: bool) -> Self {
        match (dir_exists, marker_exists) {
            (_, true) => Self::Complete {
                marker: dir.marker_path(),
            },
            (true, false) => Self::InProgress,
            (false, false) => Self::Unstarted,
        }
    }

    pub async fn inspect(dir: &ChapterDir) -> anyhow::Result<Self> {
        let dir_exists = crate::fsio::exists(&dir.path).await?;
        let marker_exists = dir_exists && crate::fsio::exists(&dir.marker_path()).await?;
        Ok(Self::derive(dir, dir_exists, marker_exists))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Already complete; the images on disk were verified.
    Verified,
    /// Images were fetched (`fetched`) or reused from an interrupted run
    /// (`reused`), then the marker was written and verified.
    Downloaded { fetched: usize, reused: usize },
}

pub struct Downloader {
    transport: Arc<dyn Transport>,
    extractor: Arc<dyn Extractor>,
    layout: Layout,
    image_policy: ConcurrencyPolicy,
}

impl Downloader {
    pub fn new(
        transport: Arc<dyn Transport>,
        extractor: Arc<dyn Extractor>,
        layout: Layout,
        image_policy: ConcurrencyPolicy,
    ) -> Self {
        Self {
            transport,
            extractor,
            layout,
            image_policy,
        }
    }

    /// Makes sure every page image of `chapter` is on disk. A chapter is
    /// downloaded from scratch when it is in the diff set, or when its
    /// completion marker records a different page list than `chapter`. A
    /// stale chapter also loses its PDF, so conversion rebuilds it once the
    /// chapter is complete again.
    pub async fn ensure_chapter_downloaded(
        &self,
        chapter: &Chapter,
        is_in_diff: bool,
    ) -> anyhow::Result<DownloadOutcome> {
        let dir = self.layout.chapter_dir(chapter.chapter_num);
        tracing::info!(pages = chapter.pages.len(), "checking chapter");

        let previous = read_marker(&dir).await?;
        let stale_reason = match &previous {
            _ if is_in_diff => Some("chapter changed on the site"),
            Some(previous) if previous.pages != chapter.pages => {
                Some("completion marker does not match the catalog page list")
            }
            _ => None,
        };
        if let Some(reason) = stale_reason {
            tracing::info!(reason, "discarding stale chapter");
            self.discard_chapter(&dir, chapter, previous.as_ref()).await?;
        }

        match ChapterState::inspect(&dir).await? {
            ChapterState::Complete { marker } => {
                tracing::debug!(marker = %marker.display(), "completion marker found");
                verify_chapter_images(&dir.path, &chapter.pages).await?;
                tracing::info!("chapter already complete");
                return Ok(DownloadOutcome::Verified);
            }
            ChapterState::Unstarted => {
                tokio::fs::create_dir_all(&dir.path)
                    .await
                    .with_context(|| format!("create chapter dir: {}", dir.path.display()))?;
            }
            ChapterState::InProgress => {
                tracing::info!("resuming interrupted chapter");
                remove_leftovers(&dir.path, &chapter.pages).await?;
            }
        }

        let present = image_stems(&dir.path).await?;
        let (reused, missing): (Vec<&Page>, Vec<&Page>) = chapter
            .pages
            .iter()
            .partition(|page| present.contains(&expected_stem(page.page_num)));

        let results = self
            .image_policy
            .run_all(missing.iter().copied(), |page| {
                let dest = dir.path.join(page_image_file_name(page.page_num));
                async move {
                    self.download_page_image(page, &dest)
                        .await
                        .with_context(|| format!("download page {}", page.page_num))
                }
            })
            .await;
        // every image task has finished; the first failure aborts this chapter
        results.into_iter().collect::<anyhow::Result<Vec<()>>>()?;

        crate::fsio::write_json_atomic(&dir.marker_path(), chapter)
            .await
            .context("write completion marker")?;
        verify_chapter_images(&dir.path, &chapter.pages).await?;

        tracing::info!(
            fetched = missing.len(),
            reused = reused.len(),
            "chapter downloaded"
        );
        Ok(DownloadOutcome::Downloaded {
            fetched: missing.len(),
            reused: reused.len(),
        })
    }

    /// Removes the chapter directory and every PDF built from it, under the
    /// current title and the title recorded by the old marker.
    async fn discard_chapter(
        &self,
        dir: &ChapterDir,
        chapter: &Chapter,
        previous: Option<&Chapter>,
    ) -> anyhow::Result<()> {
        let mut pdfs = vec![self.layout.pdf_path(&chapter.title)];
        if let Some(previous) = previous {
            let old = self.layout.pdf_path(&previous.title);
            if !pdfs.contains(&old) {
                pdfs.push(old);
            }
        }
        for pdf in pdfs {
            if crate::fsio::exists(&pdf).await? {
                tokio::fs::remove_file(&pdf)
                    .await
                    .with_context(|| format!("remove outdated pdf: {}", pdf.display()))?;
                tracing::info!(pdf = %pdf.display(), "removed outdated pdf");
            }
        }

        if crate::fsio::exists(&dir.path).await? {
            tokio::fs::remove_dir_all(&dir.path)
                .await
                .with_context(|| format!("remove stale chapter dir: {}", dir.path.display()))?;
        }
        Ok(())
    }

    /// Reader page -> image URL -> image bytes -> `dest`.
    pub async fn download_page_image(&self, page: &Page, dest: &Path) -> anyhow::Result<()> {
        let page_url =
            Url::parse(&page.url).with_context(|| format!("parse page url: {}", page.url))?;
        let html = self.transport.fetch_text(&page_url).await?;
        let image_url = self.extractor.image_url(&html, &page_url)?;
        let bytes = self.transport.fetch_bytes(&image_url).await?;
        crate::fsio::write_bytes_atomic(dest, &bytes)
            .await
            .with_context(|| format!("write image: {}", dest.display()))?;
        tracing::debug!(page = page.page_num, image = %image_url, bytes = bytes.len(), "saved page image");
        Ok(())
    }
}

/// The completion marker's chapter, if one was written.
async fn read_marker(dir: &ChapterDir) -> anyhow::Result<Option<Chapter>> {
    crate::fsio::read_json(&dir.marker_path())
        .await
        .map_err(|err| {
            Error::Consistency {
                dir: dir.path.clone(),
                message: format!("unreadable completion marker: {err:#}"),
            }
            .into()
        })
}

/// Deletes temp files of interrupted writes and images of pages that are no
/// longer listed, so only usable images are reused.
async fn remove_leftovers(dir: &Path, pages: &[Page]) -> anyhow::Result<()> {
    let expected = pages
        .iter()
        .map(|page| expected_stem(page.page_num))
        .collect::<BTreeSet<_>>();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("read chapter dir: {}", dir.display()))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("read chapter dir: {}", dir.display()))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        let unlisted = is_image_file_name(&name) && !expected.contains(&lowercase_stem(&name));
        if crate::fsio::is_tmp_file_name(&name) || unlisted {
            let path = entry.path();
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("remove leftover: {}", path.display()))?;
            tracing::debug!(file = %name, "removed leftover file");
        }
    }
    Ok(())
}

fn lowercase_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn expected_stem(page_num: u32) -> String {
    format!("page-{page_num}")
}

fn is_image_file_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".jpg") || lower.ends_with(".png")
}

/// Lowercased stems of the `.jpg`/`.png` files in `dir`.
async fn image_stems(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("read chapter dir: {}", dir.display()))?;
    let mut stems = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("read chapter dir: {}", dir.display()))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == MARKER_FILE_NAME || !is_image_file_name(&name) {
            continue;
        }
        stems.push(lowercase_stem(&name));
    }
    Ok(stems)
}

/// Compares image file stems in a chapter directory with the expected pages.
pub fn check_image_set(stems: &[String], pages: &[Page]) -> Result<(), String> {
    if stems.len() != pages.len() {
        return Err(format!(
            "found {} images but the chapter has {} pages",
            stems.len(),
            pages.len()
        ));
    }
    let present = stems.iter().map(String::as_str).collect::<BTreeSet<_>>();
    let missing = pages
        .iter()
        .map(|page| expected_stem(page.page_num))
        .filter(|stem| !present.contains(stem.as_str()))
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(format!("missing images: {}", missing.join(", ")));
    }
    Ok(())
}

pub async fn verify_chapter_images(dir: &Path, pages: &[Page]) -> anyhow::Result<()> {
    let stems = image_stems(dir).await?;
    check_image_set(&stems, pages).map_err(|message| Error::Consistency {
        dir: dir.to_path_buf(),
        message,
    })?;
    tracing::debug!(dir = %dir.display(), images = stems.len(), "chapter images verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error;
    use crate::extract::MultiverseExtractor;
    use crate::transport::testing::StubTransport;

    const BASE: &str = "https://example.com/cn";

    fn page(page_num: u32) -> Page {
        Page {
            page_num,
            url: format!("{BASE}/page-{page_num}.html"),
        }
    }

    fn chapter(num: u32, page_nums: &[u32]) -> Chapter {
        Chapter {
            chapter_num: num,
            title: format!("Chapter {num}"),
            url: format!("{BASE}/chapter-{num}.html"),
            pages: page_nums.iter().copied().map(page).collect(),
        }
    }

    fn site(page_nums: &[u32]) -> StubTransport {
        let mut stub = StubTransport::new();
        for &p in page_nums {
            stub = stub
                .with(
                    &format!("{BASE}/page-{p}.html"),
                    format!(r#"<div class="dapage" id="h_read"><img src="/img/{p}.png"></div>"#),
                )
                .with(
                    &format!("https://example.com/img/{p}.png"),
                    format!("image {p}").into_bytes(),
                );
        }
        stub
    }

    fn downloader(stub: Arc<StubTransport>, root: &Path) -> Downloader {
        Downloader::new(
            stub,
            Arc::new(MultiverseExtractor),
            Layout::new(root),
            ConcurrencyPolicy::Concurrent,
        )
    }

    #[test]
    fn derive_state_from_filesystem_facts() {
        let dir = Layout::new("results").chapter_dir(3);
        assert_eq!(ChapterState::derive(&dir, false, false), ChapterState::Unstarted);
        assert_eq!(ChapterState::derive(&dir, true, false), ChapterState::InProgress);
        assert_eq!(
            ChapterState::derive(&dir, true, true),
            ChapterState::Complete {
                marker: PathBuf::from("results/chapters/Chapter-3/meta.json")
            }
        );
    }

    #[test]
    fn check_image_set_requires_exact_pages() {
        let pages = vec![page(1), page(2)];
        let stems = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert!(check_image_set(&stems(&["page-2", "page-1"]), &pages).is_ok());
        assert!(
            check_image_set(&stems(&["page-1"]), &pages)
                .unwrap_err()
                .contains("found 1 images")
        );
        assert!(
            check_image_set(&stems(&["page-1", "page-3"]), &pages)
                .unwrap_err()
                .contains("page-2")
        );
    }

    #[tokio::test]
    async fn downloads_then_verifies_on_second_pass() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let stub = Arc::new(site(&[1, 2, 3]));
        let downloader = downloader(stub.clone(), temp.path());
        let chapter = chapter(1, &[1, 2, 3]);

        let outcome = downloader.ensure_chapter_downloaded(&chapter, false).await?;
        assert_eq!(outcome, DownloadOutcome::Downloaded { fetched: 3, reused: 0 });

        let dir = temp.path().join("chapters").join("Chapter-1");
        assert_eq!(std::fs::read(dir.join("Page-2.jpg"))?, b"image 2");
        let marker: Chapter = serde_json::from_slice(&std::fs::read(dir.join("meta.json"))?)?;
        assert_eq!(marker, chapter);

        let outcome = downloader.ensure_chapter_downloaded(&chapter, false).await?;
        assert_eq!(outcome, DownloadOutcome::Verified);
        assert_eq!(stub.hits(&format!("{BASE}/page-1.html")), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_image_in_complete_chapter_is_consistency_error() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let downloader = downloader(Arc::new(site(&[1, 2])), temp.path());
        let chapter = chapter(1, &[1, 2]);
        downloader.ensure_chapter_downloaded(&chapter, false).await?;

        std::fs::remove_file(temp.path().join("chapters/Chapter-1/Page-1.jpg"))?;
        let err = downloader
            .ensure_chapter_downloaded(&chapter, false)
            .await
            .unwrap_err();
        assert!(
            matches!(error::classify(&err), Some(Error::Consistency { .. })),
            "{err:#}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn chapter_in_diff_is_downloaded_from_scratch() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let stub = Arc::new(site(&[1, 2]));
        let downloader = downloader(stub.clone(), temp.path());
        downloader
            .ensure_chapter_downloaded(&chapter(1, &[1]), false)
            .await?;

        let grown = chapter(1, &[1, 2]);
        let outcome = downloader.ensure_chapter_downloaded(&grown, true).await?;
        assert_eq!(outcome, DownloadOutcome::Downloaded { fetched: 2, reused: 0 });
        assert_eq!(stub.hits(&format!("{BASE}/page-1.html")), 2);
        Ok(())
    }

    #[tokio::test]
    async fn marker_with_other_page_list_is_downloaded_again() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let stub = Arc::new(site(&[1, 2]));
        let downloader = downloader(stub.clone(), temp.path());
        downloader
            .ensure_chapter_downloaded(&chapter(1, &[1]), false)
            .await?;

        // the catalog grew but this run does not know the chapter changed
        let grown = chapter(1, &[1, 2]);
        let outcome = downloader.ensure_chapter_downloaded(&grown, false).await?;
        assert_eq!(outcome, DownloadOutcome::Downloaded { fetched: 2, reused: 0 });

        let marker: Chapter = serde_json::from_slice(&std::fs::read(
            temp.path().join("chapters/Chapter-1/meta.json"),
        )?)?;
        assert_eq!(marker, grown);
        Ok(())
    }

    #[tokio::test]
    async fn stale_chapter_loses_its_pdf_even_when_download_fails() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let layout = Layout::new(temp.path());
        // page 2 is not served
        let downloader = downloader(Arc::new(site(&[1])), temp.path());
        let mut old = chapter(1, &[1]);
        old.title = "Old title".to_string();
        downloader.ensure_chapter_downloaded(&old, false).await?;

        std::fs::create_dir_all(layout.pdf_dir())?;
        std::fs::write(layout.pdf_path("Old title"), b"%PDF-old")?;
        std::fs::write(layout.pdf_path("Chapter 1"), b"%PDF-old")?;

        let err = downloader
            .ensure_chapter_downloaded(&chapter(1, &[1, 2]), true)
            .await
            .unwrap_err();
        assert!(
            matches!(error::classify(&err), Some(Error::Network { .. })),
            "{err:#}"
        );
        assert!(!layout.pdf_path("Old title").exists());
        assert!(!layout.pdf_path("Chapter 1").exists());
        Ok(())
    }

    #[tokio::test]
    async fn resume_removes_tmp_files_and_unlisted_images() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let stub = Arc::new(site(&[1, 2]));
        let downloader = downloader(stub, temp.path());
        let dir = temp.path().join("chapters/Chapter-1");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("Page-1.jpg"), b"image 1")?;
        std::fs::write(dir.join("Page-2.jpg.tmp.0123abcd"), b"ima")?;
        std::fs::write(dir.join("Page-9.jpg"), b"image 9")?;

        let outcome = downloader
            .ensure_chapter_downloaded(&chapter(1, &[1, 2]), false)
            .await?;
        assert_eq!(outcome, DownloadOutcome::Downloaded { fetched: 1, reused: 1 });

        let mut names = std::fs::read_dir(&dir)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        names.sort();
        assert_eq!(names, vec!["Page-1.jpg", "Page-2.jpg", "meta.json"]);
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_chapter_resumes_with_missing_pages_only() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let stub = Arc::new(site(&[1, 2]));
        let downloader = downloader(stub.clone(), temp.path());
        let dir = temp.path().join("chapters/Chapter-1");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("Page-1.jpg"), b"image 1")?;

        let outcome = downloader
            .ensure_chapter_downloaded(&chapter(1, &[1, 2]), false)
            .await?;
        assert_eq!(outcome, DownloadOutcome::Downloaded { fetched: 1, reused: 1 });
        assert_eq!(stub.hits(&format!("{BASE}/page-1.html")), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_page_leaves_chapter_without_marker() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        // page 2 is not served
        let downloader = downloader(Arc::new(site(&[1])), temp.path());
        let err = downloader
            .ensure_chapter_downloaded(&chapter(1, &[1, 2]), false)
            .await
            .unwrap_err();
        assert!(
            matches!(error::classify(&err), Some(Error::Network { .. })),
            "{err:#}"
        );

        let dir = Layout::new(temp.path()).chapter_dir(1);
        assert_eq!(ChapterState::inspect(&dir).await?, ChapterState::InProgress);
        Ok(())
    }

    #[tokio::test]
    async fn page_without_image_is_image_not_found() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let stub = StubTransport::new().with(&format!("{BASE}/page-1.html"), "<p>no image</p>");
        let downloader = downloader(Arc::new(stub), temp.path());
        let err = downloader
            .download_page_image(&page(1), &temp.path().join("Page-1.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(
            error::classify(&err),
            Some(Error::ImageNotFound { .. })
        ));
        assert!(!temp.path().join("Page-1.jpg").exists());
        Ok(())
    }
}
