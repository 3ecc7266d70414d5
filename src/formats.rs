use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub page_num: u32,
    pub url: String,
}

/// One entry of the chapter index, before its page list is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterListing {
    pub chapter_num: u32,
    pub title: String,
    pub url: String,
}

impl ChapterListing {
    pub fn with_pages(self, pages: Vec<Page>) -> Chapter {
        Chapter {
            chapter_num: self.chapter_num,
            title: self.title,
            url: self.url,
            pages,
        }
    }
}

/// A chapter with its ordered page list. This is also the completion marker
/// (`meta.json`) written into each chapter directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub chapter_num: u32,
    pub title: String,
    pub url: String,
    pub pages: Vec<Page>,
}

/// On-disk shape of the catalog (`details.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogFile {
    /// Epoch milliseconds.
    pub update_timestamp: i64,
    pub update_time_formatted: String,
    /// Display only; never trusted on read.
    pub chapters_length: usize,
    pub chapters: Vec<Chapter>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_uses_camel_case_keys() {
        let chapter = Chapter {
            chapter_num: 3,
            title: "Chapter 3".to_string(),
            url: "https://example.com/cn/chapters.html?chapter=3".to_string(),
            pages: vec![Page {
                page_num: 41,
                url: "https://example.com/cn/page-41.html".to_string(),
            }],
        };

        let value = serde_json::to_value(&chapter).unwrap();
        assert_eq!(value["chapterNum"], 3);
        assert_eq!(value["pages"][0]["pageNum"], 41);
    }

    #[test]
    fn catalog_file_reads_camel_case_fields() {
        let json = r#"{
          "updateTimestamp": 1700000000000,
          "updateTimeFormatted": "2023/11/14 22:13:20",
          "chaptersLength": 99,
          "chapters": [
            {"chapterNum": 1, "title": "One", "url": "https://example.com/1", "pages": []}
          ]
        }"#;
        let file: CatalogFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.update_timestamp, 1_700_000_000_000);
        assert_eq!(file.chapters_length, 99);
        assert_eq!(file.chapters.len(), 1);
    }
}
