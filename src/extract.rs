//! Site-specific HTML extraction. All knowledge of the site's markup lives
//! here, so a layout change touches only this module.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::Error;
use crate::formats::{ChapterListing, Page};

static PAGE_NUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"page-(\d+)\.html").expect("valid page number regex"));

static BACKGROUND_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"background-image\s*:\s*url\(\s*['"]?([^'")]+?)['"]?\s*\)"#)
        .expect("valid background image regex")
});

pub trait Extractor: Send + Sync {
    /// Chapter index entries in document order.
    fn chapter_list(&self, html: &str, index_url: &Url) -> Result<Vec<ChapterListing>, Error>;

    /// Pages of one chapter in document order.
    fn page_list(&self, html: &str, chapter_url: &Url) -> Result<Vec<Page>, Error>;

    /// The single comic image shown on a reader page.
    fn image_url(&self, html: &str, page_url: &Url) -> Result<Url, Error>;
}

/// Markup of the Dragon Ball Multiverse reader:
///
/// - index: `<div num_chapter="N"> <a href=".."> <h4>title</h4> </a> </div>`
/// - chapter: `<div class="pageslist"> <a href="page-K.html">..</a> .. </div>`
/// - reader page: `<div class="dapage" id="h_read"> <img src=".."> </div>`
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiverseExtractor;

impl Extractor for MultiverseExtractor {
    fn chapter_list(&self, html: &str, index_url: &Url) -> Result<Vec<ChapterListing>, Error> {
        let document = Html::parse_document(html);
        let entry_sel = selector("[num_chapter]");
        let link_sel = selector("a[href]");
        let title_sel = selector("h4");

        let mut chapters = Vec::new();
        for entry in document.select(&entry_sel) {
            let raw_num = entry.value().attr("num_chapter").unwrap_or_default();
            let chapter_num = raw_num.trim().parse::<u32>().map_err(|_| {
                Error::parse(
                    index_url.as_str(),
                    format!("invalid chapter number: {raw_num:?}"),
                )
            })?;

            let href = entry
                .select(&link_sel)
                .next()
                .and_then(|link| link.value().attr("href"))
                .ok_or_else(|| {
                    Error::parse(
                        index_url.as_str(),
                        format!("chapter link not found for chapter {chapter_num}"),
                    )
                })?;
            let title = entry
                .select(&title_sel)
                .next()
                .map(element_text)
                .ok_or_else(|| {
                    Error::parse(
                        index_url.as_str(),
                        format!("chapter title not found for chapter {chapter_num}"),
                    )
                })?;

            chapters.push(ChapterListing {
                chapter_num,
                title,
                url: join(index_url, href)?.to_string(),
            });
        }

        if chapters.is_empty() {
            return Err(Error::parse(index_url.as_str(), "no chapter entries found"));
        }
        Ok(chapters)
    }

    fn page_list(&self, html: &str, chapter_url: &Url) -> Result<Vec<Page>, Error> {
        let document = Html::parse_document(html);
        let container_sel = selector("div.pageslist");
        let link_sel = selector("a[href]");
        let container = document
            .select(&container_sel)
            .next()
            .ok_or_else(|| Error::parse(chapter_url.as_str(), "page list container not found"))?;

        container
            .select(&link_sel)
            .filter_map(|link| link.value().attr("href"))
            .map(|href| {
                let page_num = page_num_from_href(href).ok_or_else(|| {
                    Error::parse(
                        chapter_url.as_str(),
                        format!("page link does not match page-<n>.html: {href}"),
                    )
                })?;
                Ok(Page {
                    page_num,
                    url: join(chapter_url, href)?.to_string(),
                })
            })
            .collect()
    }

    fn image_url(&self, html: &str, page_url: &Url) -> Result<Url, Error> {
        let document = Html::parse_document(html);
        let reader_sel = selector("div.dapage#h_read");
        let link_sel = selector("a[href]");
        let reader = document.select(&reader_sel).next();
        let reader_links = document
            .select(&link_sel)
            .filter(|link| is_reader_link(link.value().attr("href").unwrap_or_default()));

        let src = reader
            .into_iter()
            .chain(reader_links)
            .find_map(image_src_in);
        match src {
            Some(src) => join(page_url, &src),
            None => Err(Error::ImageNotFound {
                url: page_url.to_string(),
            }),
        }
    }
}

pub fn page_num_from_href(href: &str) -> Option<u32> {
    PAGE_NUM_RE
        .captures(href)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn is_reader_link(href: &str) -> bool {
    href.ends_with("#h_read") && page_num_from_href(href).is_some()
}

/// `<img src>` first, then a CSS background image, on the element or below it.
fn image_src_in(container: ElementRef<'_>) -> Option<String> {
    let img_sel = selector("img[src]");
    let styled_sel = selector("[style]");
    let img = container
        .select(&img_sel)
        .filter_map(|img| img.value().attr("src"))
        .map(str::trim)
        .find(|src| !src.is_empty());
    if let Some(src) = img {
        return Some(src.to_string());
    }

    std::iter::once(container)
        .chain(container.select(&styled_sel))
        .filter_map(|el| el.value().attr("style"))
        .find_map(|style| {
            BACKGROUND_IMAGE_RE
                .captures(style)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
        })
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn join(base: &Url, href: &str) -> Result<Url, Error> {
    base.join(href.trim())
        .map_err(|err| Error::parse(base.as_str(), format!("invalid link {href:?}: {err}")))
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector is valid")
}
