use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use url::Url;

use crate::catalog::Catalog;
use crate::extract::Extractor;
use crate::formats::{Chapter, ChapterListing, Page};
use crate::pool::ConcurrencyPolicy;
use crate::transport::Transport;

/// Result of reconciling the stored catalog with a fresh scrape.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Stored chapters below the previous maximum, plus `diff`, sorted.
    pub merged: Catalog,
    /// Chapters scraped this run: the previous maximum and everything above it.
    pub diff: Vec<Chapter>,
}

impl Resolution {
    pub fn diff_nums(&self) -> Vec<u32> {
        self.diff.iter().map(|chapter| chapter.chapter_num).collect()
    }
}

pub struct ChapterResolver {
    transport: Arc<dyn Transport>,
    extractor: Arc<dyn Extractor>,
    page_list_policy: ConcurrencyPolicy,
}

impl ChapterResolver {
    pub fn new(
        transport: Arc<dyn Transport>,
        extractor: Arc<dyn Extractor>,
        page_list_policy: ConcurrencyPolicy,
    ) -> Self {
        Self {
            transport,
            extractor,
            page_list_policy,
        }
    }

    /// Scrapes the chapter index, ascending by chapter number.
    pub async fn list_chapters(&self, index_url: &Url) -> anyhow::Result<Vec<ChapterListing>> {
        let html = self.transport.fetch_text(index_url).await?;
        let mut chapters = self.extractor.chapter_list(&html, index_url)?;
        chapters.sort_by_key(|chapter| chapter.chapter_num);
        Ok(chapters)
    }

    /// Scrapes one chapter's pages, ascending by page number.
    pub async fn list_pages(&self, chapter_url: &Url) -> anyhow::Result<Vec<Page>> {
        let html = self.transport.fetch_text(chapter_url).await?;
        let mut pages = self.extractor.page_list(&html, chapter_url)?;
        pages.sort_by_key(|page| page.page_num);
        let listed = pages.len();
        pages.dedup_by_key(|page| page.page_num);
        if pages.len() != listed {
            tracing::debug!(
                url = %chapter_url,
                duplicates = listed - pages.len(),
                "dropped duplicate page links"
            );
        }
        Ok(pages)
    }

    pub async fn resolve_diff(
        &self,
        existing: &Catalog,
        index_url: &Url,
    ) -> anyhow::Result<Resolution> {
        let max_known = existing.max_chapter_num();
        tracing::info!(url = %index_url, ?max_known, "fetching chapter index");

        let listings = self
            .list_chapters(index_url)
            .await
            .context("list chapters")?;
        tracing::info!(chapters = listings.len(), "fetched chapter index");

        let in_scope = select_in_scope(listings, max_known);
        tracing::info!(
            chapters = ?in_scope.iter().map(|c| c.chapter_num).collect::<Vec<_>>(),
            "chapters to resolve"
        );

        let mut diff = self
            .page_list_policy
            .try_run_all(in_scope, |listing| async move {
                let url = Url::parse(&listing.url)
                    .with_context(|| format!("parse chapter url: {}", listing.url))?;
                let pages = self
                    .list_pages(&url)
                    .await
                    .with_context(|| format!("list pages of chapter {}", listing.chapter_num))?;
                tracing::info!(
                    chapter = listing.chapter_num,
                    pages = pages.len(),
                    "resolved page list"
                );
                anyhow::Ok(listing.with_pages(pages))
            })
            .await?;
        diff.sort_by_key(|chapter| chapter.chapter_num);

        let merged = merge(existing, &diff);
        Ok(Resolution { merged, diff })
    }
}

/// Keeps listings at or above the highest stored chapter. The highest stored
/// chapter itself is kept because the site may still append pages to it.
pub fn select_in_scope(listings: Vec<ChapterListing>, max_known: Option<u32>) -> Vec<ChapterListing> {
    match max_known {
        Some(max) => listings
            .into_iter()
            .filter(|listing| listing.chapter_num >= max)
            .collect(),
        None => listings,
    }
}

/// Existing catalog without its highest chapter, plus the freshly resolved
/// chapters. Chapters of `diff` replace stored ones with the same number.
pub fn merge(existing: &Catalog, diff: &[Chapter]) -> Catalog {
    let max_known = existing.max_chapter_num();
    let kept = existing
        .chapters()
        .iter()
        .filter(|chapter| Some(chapter.chapter_num) != max_known)
        .cloned();
    Catalog::new(Some(Utc::now()), kept.chain(diff.iter().cloned()).collect())
}
