use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;

use crate::error::Error;
use crate::formats::Chapter;
use crate::layout::{ChapterDir, Layout};

/// Decides that a chapter must not be converted at all.
pub type SkipPredicate = Arc<dyn Fn(&ChapterDir) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertOutcome {
    /// The skip predicate excluded this chapter.
    Skipped,
    /// No completion marker; the chapter is not fully downloaded.
    Incomplete,
    UpToDate(PathBuf),
    Written(PathBuf),
    /// Assembly failed; the error was logged and the run goes on.
    Failed(PathBuf),
}

pub struct Converter {
    layout: Layout,
    skip: SkipPredicate,
    cover: Option<PathBuf>,
}

impl Converter {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            skip: Arc::new(|_: &ChapterDir| false),
            cover: None,
        }
    }

    pub fn with_skip(mut self, skip: SkipPredicate) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_cover(mut self, cover: Option<PathBuf>) -> Self {
        self.cover = cover;
        self
    }

    /// Makes sure the chapter's PDF exists, regenerating it when
    /// `force_regenerate` is set.
    pub async fn ensure_chapter_pdf(
        &self,
        dir: &ChapterDir,
        force_regenerate: bool,
    ) -> anyhow::Result<ConvertOutcome> {
        let marker_path = dir.marker_path();
        let meta: Option<Chapter> = crate::fsio::read_json(&marker_path)
            .await
            .with_context(|| format!("read completion marker: {}", marker_path.display()))?;
        let Some(meta) = meta else {
            tracing::warn!(dir = %dir.path.display(), "no completion marker; skipping conversion");
            return Ok(ConvertOutcome::Incomplete);
        };

        let images = list_page_images(&dir.path).await?;
        if images.len() != meta.pages.len() {
            tracing::warn!(
                images = images.len(),
                pages = meta.pages.len(),
                "image count differs from completion marker"
            );
        }
        let output_path = self.layout.pdf_path(&meta.title);

        if (self.skip)(dir) {
            tracing::info!(output = %output_path.display(), "chapter excluded from conversion");
            return Ok(ConvertOutcome::Skipped);
        }

        if crate::fsio::exists(&output_path).await? {
            if !force_regenerate {
                tracing::info!(output = %output_path.display(), "pdf exists; skipping");
                return Ok(ConvertOutcome::UpToDate(output_path));
            }
            tracing::info!(output = %output_path.display(), "chapter changed; removing old pdf");
            tokio::fs::remove_file(&output_path)
                .await
                .with_context(|| format!("remove old pdf: {}", output_path.display()))?;
        }

        let cover = self.cover.clone();
        let output = output_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            crate::pdf::render_pdf_file(cover.as_deref(), &images, &output)
        })
        .await
        .context("join pdf task")?;

        match result {
            Ok(()) => {
                tracing::info!(output = %output_path.display(), "pdf written");
                Ok(ConvertOutcome::Written(output_path))
            }
            Err(err) => {
                let err = Error::Conversion {
                    path: output_path.clone(),
                    message: format!("{err:#}"),
                };
                tracing::error!(%err, "pdf conversion failed");
                Ok(ConvertOutcome::Failed(output_path))
            }
        }
    }
}

/// Page images in a chapter directory, ordered by the number embedded in
/// their names (`Page-9.jpg` before `Page-10.jpg`).
pub async fn list_page_images(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("read chapter dir: {}", dir.display()))?;
    let mut images = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("read chapter dir: {}", dir.display()))?
    {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("png"));
        if is_image {
            images.push(path);
        }
    }
    sort_by_page_index(&mut images);
    Ok(images)
}

pub fn sort_by_page_index(images: &mut [PathBuf]) {
    images.sort_by(|a, b| {
        page_index(a)
            .cmp(&page_index(b))
            .then_with(|| a.file_name().cmp(&b.file_name()))
    });
}

/// Number after the last `-` of the file stem. Names without one sort last.
fn page_index(path: &Path) -> (bool, u64) {
    let index = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.rsplit('-').next())
        .and_then(|digits| digits.parse::<u64>().ok());
    match index {
        Some(index) => (false, index),
        None => (true, 0),
    }
}
