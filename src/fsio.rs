use std::path::Path;

use anyhow::Context as _;
use tokio::fs;

/// Reads a JSON file; a missing file is `Ok(None)`.
pub async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

pub async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    write_bytes_atomic(path, &data).await
}

/// Writes to a sibling temp file and renames it over `path`, so readers never
/// observe a truncated file.
pub async fn write_bytes_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = tmp_sibling(path);
    fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    if let Err(err) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err).with_context(|| format!("rename tmp to final: {}", path.display()));
    }
    Ok(())
}

pub async fn exists(path: &Path) -> anyhow::Result<bool> {
    fs::try_exists(path)
        .await
        .with_context(|| format!("stat: {}", path.display()))
}

const TMP_INFIX: &str = ".tmp.";

/// True for the temp files left behind by an interrupted atomic write.
pub fn is_tmp_file_name(name: &str) -> bool {
    name.contains(TMP_INFIX)
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    path.with_extension(format!("{ext}{TMP_INFIX}{}", uuid::Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_json_is_none() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let value: Option<serde_json::Value> = read_json(&temp.path().join("nope.json")).await?;
        assert!(value.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_tmp_files() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("nested").join("data.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).await?;
        write_json_atomic(&path, &serde_json::json!({"a": 2})).await?;

        let value: Option<serde_json::Value> = read_json(&path).await?;
        assert_eq!(value, Some(serde_json::json!({"a": 2})));

        let names = std::fs::read_dir(path.parent().unwrap())?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(names, vec!["data.json".to_string()]);
        Ok(())
    }

    #[test]
    fn tmp_sibling_keeps_original_extension_visible() {
        let tmp = tmp_sibling(Path::new("/x/Page-3.jpg"));
        let name = tmp.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("Page-3.jpg.tmp."));
        assert!(is_tmp_file_name(&name));
        assert!(!is_tmp_file_name("Page-3.jpg"));
    }
}
