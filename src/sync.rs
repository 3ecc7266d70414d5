use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context as _;
use tracing::Instrument as _;
use url::Url;

use crate::catalog::{Catalog, CatalogStore, LocalFsCatalogStore};
use crate::cli::{ConvertArgs, DownloadArgs, HttpArgs, PdfArgs, ResolveArgs, SyncArgs};
use crate::convert::{ConvertOutcome, Converter};
use crate::download::{DownloadOutcome, Downloader};
use crate::error::{self, Error};
use crate::extract::{Extractor, MultiverseExtractor};
use crate::formats::Chapter;
use crate::layout::{ChapterDir, Layout};
use crate::pool::ConcurrencyPolicy;
use crate::resolve::{ChapterResolver, Resolution};
use crate::transport::{HttpTransport, Transport};

/// Full pipeline: refresh catalog, download, convert.
pub async fn run(args: SyncArgs) -> anyhow::Result<()> {
    let layout = Layout::new(&args.out);
    let index_url = parse_index_url(&args.url)?;
    check_cover(args.pdf.cover.as_deref()).await?;
    let policies = args.policies();
    let (transport, extractor) = site(&args.http)?;
    let store = LocalFsCatalogStore::new(layout.catalog_path());
    let resolver = ChapterResolver::new(transport.clone(), extractor.clone(), policies.page_lists);

    tracing::info!(out = %layout.root().display(), update = args.update, "sync: resolve");
    let resolution = refresh_catalog(&store, &resolver, &index_url, args.update).await?;
    let stale = resolution.diff_nums().into_iter().collect::<BTreeSet<_>>();

    tracing::info!(
        chapters = resolution.merged.len(),
        stale = ?stale,
        "sync: download"
    );
    let downloader = Downloader::new(transport, extractor, layout.clone(), policies.images);
    let report = download_chapters(
        &downloader,
        resolution.merged.chapters(),
        &stale,
        policies.chapters,
    )
    .await?;

    tracing::info!("sync: convert");
    let converter = converter(&layout, &args.pdf);
    let dirs = layout.list_chapter_dirs().await?;
    let outcomes = convert_chapters(&converter, dirs, &stale, policies.pdfs).await;

    log_summary(&report, &outcomes);
    report.into_result()
}

/// Resolves the catalog against the site and saves it, without downloading.
/// Prints the chapter numbers of the diff set to stdout.
pub async fn run_resolve(args: ResolveArgs) -> anyhow::Result<()> {
    let layout = Layout::new(&args.out);
    let index_url = parse_index_url(&args.url)?;
    let (transport, extractor) = site(&args.http)?;
    let store = LocalFsCatalogStore::new(layout.catalog_path());
    let resolver = ChapterResolver::new(transport, extractor, args.page_list_concurrency);

    let resolution = refresh_catalog(&store, &resolver, &index_url, true).await?;
    for num in resolution.diff_nums() {
        println!("{num}");
    }
    Ok(())
}

/// Downloads every chapter of the stored catalog. Nothing is treated as
/// stale, so complete chapters are only verified.
pub async fn run_download(args: DownloadArgs) -> anyhow::Result<()> {
    let layout = Layout::new(&args.out);
    let store = LocalFsCatalogStore::new(layout.catalog_path());
    let Some(catalog) = store.load().await? else {
        anyhow::bail!(
            "no catalog at {}; run `comicsync resolve` or `comicsync sync` first",
            store.path().display()
        );
    };
    let (transport, extractor) = site(&args.http)?;
    let downloader = Downloader::new(
        transport,
        extractor,
        layout,
        args.download.image_concurrency,
    );

    let report = download_chapters(
        &downloader,
        catalog.chapters(),
        &BTreeSet::new(),
        args.download.chapter_concurrency,
    )
    .await?;
    log_summary(&report, &[]);
    report.into_result()
}

/// Builds PDFs for the chapter directories already on disk.
pub async fn run_convert(args: ConvertArgs) -> anyhow::Result<()> {
    let layout = Layout::new(&args.out);
    check_cover(args.pdf.cover.as_deref()).await?;
    let converter = converter(&layout, &args.pdf);
    let force = args.force.iter().copied().collect::<BTreeSet<_>>();

    let dirs = layout.list_chapter_dirs().await?;
    let outcomes = convert_chapters(&converter, dirs, &force, args.pdf.pdf_concurrency).await;
    log_summary(&DownloadReport::default(), &outcomes);
    Ok(())
}

/// Reuses the stored catalog unless `update` is set or there is none yet.
/// A fresh resolution is saved before anything is downloaded.
pub async fn refresh_catalog(
    store: &dyn CatalogStore,
    resolver: &ChapterResolver,
    index_url: &Url,
    update: bool,
) -> anyhow::Result<Resolution> {
    let existing = store.load().await.context("load catalog")?;
    let existing = match existing {
        Some(catalog) if !update => {
            tracing::info!(
                chapters = catalog.len(),
                "catalog exists; reusing it (pass --update to re-scrape)"
            );
            return Ok(Resolution {
                merged: catalog,
                diff: Vec::new(),
            });
        }
        Some(catalog) => catalog,
        None => Catalog::default(),
    };

    let resolution = resolver
        .resolve_diff(&existing, index_url)
        .await
        .context("resolve chapters")?;
    store
        .save(&resolution.merged)
        .await
        .context("save catalog")?;
    Ok(resolution)
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    pub downloaded: Vec<u32>,
    pub verified: Vec<u32>,
    pub failed: Vec<(u32, anyhow::Error)>,
}

impl DownloadReport {
    /// Err listing the failed chapters, if any.
    pub fn into_result(self) -> anyhow::Result<()> {
        if self.failed.is_empty() {
            return Ok(());
        }
        let details = self
            .failed
            .iter()
            .map(|(num, err)| format!("  chapter {num}: {err:#}"))
            .collect::<Vec<_>>()
            .join("\n");
        anyhow::bail!(
            "{} chapter(s) failed to download:\n{details}",
            self.failed.len()
        )
    }
}

/// Runs the download stage. Chapter-scoped failures land in the report.
/// A run-fatal failure lets in-flight chapters finish, starts no new ones,
/// then is returned as the error.
pub async fn download_chapters(
    downloader: &Downloader,
    chapters: &[Chapter],
    stale: &BTreeSet<u32>,
    policy: ConcurrencyPolicy,
) -> anyhow::Result<DownloadReport> {
    let halted = AtomicBool::new(false);
    let results = policy
        .run_all(chapters, |chapter| {
            let halted = &halted;
            let num = chapter.chapter_num;
            let span = tracing::info_span!("chapter", chapter = num);
            async move {
                if halted.load(Ordering::SeqCst) {
                    tracing::debug!("run halted; not starting chapter");
                    return None;
                }
                let result = downloader
                    .ensure_chapter_downloaded(chapter, stale.contains(&num))
                    .await
                    .with_context(|| format!("download chapter {num}"));
                if let Err(err) = &result {
                    if is_run_fatal(err) {
                        halted.store(true, Ordering::SeqCst);
                    }
                    tracing::error!(error = %format!("{err:#}"), "chapter download failed");
                }
                Some((num, result))
            }
            .instrument(span)
        })
        .await;

    let mut report = DownloadReport::default();
    let mut fatal = None;
    for (num, result) in results.into_iter().flatten() {
        match result {
            Ok(DownloadOutcome::Verified) => report.verified.push(num),
            Ok(DownloadOutcome::Downloaded { .. }) => report.downloaded.push(num),
            Err(err) if is_run_fatal(&err) => {
                if fatal.is_none() {
                    fatal = Some(err);
                }
            }
            Err(err) => report.failed.push((num, err)),
        }
    }
    if let Some(err) = fatal {
        return Err(err.context("download stopped; fix the chapter directory and re-run"));
    }
    Ok(report)
}

/// Runs the conversion stage. Never fails: per-chapter problems are logged.
pub async fn convert_chapters(
    converter: &Converter,
    dirs: Vec<ChapterDir>,
    force: &BTreeSet<u32>,
    policy: ConcurrencyPolicy,
) -> Vec<(u32, ConvertOutcome)> {
    policy
        .run_all(dirs, |dir| {
            let span = tracing::info_span!("chapter", chapter = dir.chapter_num);
            async move {
                let outcome = match converter
                    .ensure_chapter_pdf(&dir, force.contains(&dir.chapter_num))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::error!(error = %format!("{err:#}"), "pdf conversion failed");
                        ConvertOutcome::Failed(dir.path.clone())
                    }
                };
                (dir.chapter_num, outcome)
            }
            .instrument(span)
        })
        .await
}

fn is_run_fatal(err: &anyhow::Error) -> bool {
    error::classify(err).is_some_and(Error::is_run_fatal)
}

fn site(http: &HttpArgs) -> anyhow::Result<(Arc<dyn Transport>, Arc<dyn Extractor>)> {
    let transport = HttpTransport::new(http.to_config()).context("build http client")?;
    Ok((Arc::new(transport), Arc::new(MultiverseExtractor)))
}

fn converter(layout: &Layout, pdf: &PdfArgs) -> Converter {
    let skip = pdf.skip_pdf.iter().copied().collect::<BTreeSet<u32>>();
    Converter::new(layout.clone())
        .with_cover(pdf.cover.clone())
        .with_skip(Arc::new(move |dir: &ChapterDir| {
            skip.contains(&dir.chapter_num)
        }))
}

fn parse_index_url(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("parse index url: {raw}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("index url must be http or https: {url}");
    }
    Ok(url)
}

async fn check_cover(cover: Option<&Path>) -> anyhow::Result<()> {
    if let Some(cover) = cover {
        if !crate::fsio::exists(cover).await? {
            anyhow::bail!("cover image not found: {}", cover.display());
        }
    }
    Ok(())
}

fn log_summary(report: &DownloadReport, outcomes: &[(u32, ConvertOutcome)]) {
    let count = |pred: fn(&ConvertOutcome) -> bool| {
        outcomes.iter().filter(|(_, outcome)| pred(outcome)).count()
    };
    tracing::info!(
        downloaded = report.downloaded.len(),
        verified = report.verified.len(),
        download_failed = report.failed.len(),
        pdf_written = count(|o| matches!(o, ConvertOutcome::Written(_))),
        pdf_up_to_date = count(|o| matches!(o, ConvertOutcome::UpToDate(_))),
        pdf_skipped = count(|o| matches!(o, ConvertOutcome::Skipped | ConvertOutcome::Incomplete)),
        pdf_failed = count(|o| matches!(o, ConvertOutcome::Failed(_))),
        "done"
    );
}
