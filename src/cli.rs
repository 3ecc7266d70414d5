use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::config::{DEFAULT_SITE_URL, HttpConfig, StagePolicies};
use crate::pool::ConcurrencyPolicy;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Only log warnings and errors (`RUST_LOG` still wins).
    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Refresh the catalog, download missing chapters, build PDFs.
    Sync(SyncArgs),
    /// Refresh the catalog only and print the re-scraped chapter numbers.
    Resolve(ResolveArgs),
    /// Download every chapter of the stored catalog.
    Download(DownloadArgs),
    /// Build PDFs for downloaded chapters.
    Convert(ConvertArgs),
}

#[derive(Debug, Clone, Args)]
pub struct SyncArgs {
    /// Workspace directory (catalog, chapter images, PDFs).
    #[arg(long, default_value = "results")]
    pub out: PathBuf,

    /// Chapter index URL.
    #[arg(long, default_value = DEFAULT_SITE_URL)]
    pub url: String,

    /// Re-scrape the chapter index even when a catalog exists.
    #[arg(
        long,
        num_args = 0..=1,
        default_missing_value = "true",
        default_value_t = false,
        action = ArgAction::Set
    )]
    pub update: bool,

    #[arg(long, default_value = "bounded:8", value_parser = ConcurrencyPolicy::parse)]
    pub page_list_concurrency: ConcurrencyPolicy,

    #[command(flatten)]
    pub download: DownloadPolicyArgs,

    #[command(flatten)]
    pub pdf: PdfArgs,

    #[command(flatten)]
    pub http: HttpArgs,
}

impl SyncArgs {
    pub fn policies(&self) -> StagePolicies {
        StagePolicies {
            page_lists: self.page_list_concurrency,
            images: self.download.image_concurrency,
            chapters: self.download.chapter_concurrency,
            pdfs: self.pdf.pdf_concurrency,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ResolveArgs {
    /// Workspace directory (catalog, chapter images, PDFs).
    #[arg(long, default_value = "results")]
    pub out: PathBuf,

    /// Chapter index URL.
    #[arg(long, default_value = DEFAULT_SITE_URL)]
    pub url: String,

    #[arg(long, default_value = "bounded:8", value_parser = ConcurrencyPolicy::parse)]
    pub page_list_concurrency: ConcurrencyPolicy,

    #[command(flatten)]
    pub http: HttpArgs,
}

#[derive(Debug, Clone, Args)]
pub struct DownloadArgs {
    /// Workspace directory (catalog, chapter images, PDFs).
    #[arg(long, default_value = "results")]
    pub out: PathBuf,

    #[command(flatten)]
    pub download: DownloadPolicyArgs,

    #[command(flatten)]
    pub http: HttpArgs,
}

#[derive(Debug, Clone, Args)]
pub struct ConvertArgs {
    /// Workspace directory (catalog, chapter images, PDFs).
    #[arg(long, default_value = "results")]
    pub out: PathBuf,

    /// Chapters whose PDF is rebuilt even if it exists (comma separated).
    #[arg(long, value_delimiter = ',')]
    pub force: Vec<u32>,

    #[command(flatten)]
    pub pdf: PdfArgs,
}

#[derive(Debug, Clone, Args)]
pub struct DownloadPolicyArgs {
    /// Image downloads in flight within one chapter.
    #[arg(long, default_value = "bounded:8", value_parser = ConcurrencyPolicy::parse)]
    pub image_concurrency: ConcurrencyPolicy,

    /// Chapters downloaded at the same time.
    #[arg(long, default_value = "sequential", value_parser = ConcurrencyPolicy::parse)]
    pub chapter_concurrency: ConcurrencyPolicy,
}

#[derive(Debug, Clone, Args)]
pub struct PdfArgs {
    /// Chapters never converted to PDF (comma separated).
    #[arg(long, value_delimiter = ',')]
    pub skip_pdf: Vec<u32>,

    /// Image prepended to every PDF as its first page.
    #[arg(long)]
    pub cover: Option<PathBuf>,

    /// Chapters converted at the same time.
    #[arg(long, default_value = "sequential", value_parser = ConcurrencyPolicy::parse)]
    pub pdf_concurrency: ConcurrencyPolicy,
}

#[derive(Debug, Clone, Args)]
pub struct HttpArgs {
    /// Per-request timeout.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Extra attempts on timeouts, connection errors, 429 and 5xx.
    #[arg(long, default_value_t = 2)]
    pub retries: u32,
}

impl HttpArgs {
    pub fn to_config(&self) -> HttpConfig {
        HttpConfig::default()
            .with_timeout_secs(self.timeout_secs)
            .with_max_retries(self.retries)
    }
}
