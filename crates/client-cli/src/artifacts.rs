//! Turning server-relative artifact paths into URLs and saving them locally.

use anyhow::{bail, Result};
use reqwest::{Client, Url};
use std::path::{Path, PathBuf};

/// `{base}/{path}` with backslashes turned into slashes and a leading `./` removed.
pub fn artifact_url(base_url: &str, path: &str) -> String {
    let normalized = path.replace('\\', "/");
    let normalized = normalized.strip_prefix("./").unwrap_or(&normalized);
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        normalized.trim_start_matches('/')
    )
}

/// Last path segment, percent-decoded, or `download` when there is none.
pub fn filename_from_url(url: &str) -> String {
    let last = match Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string(),
        Err(_) => url.rsplit('/').next().unwrap_or_default().to_string(),
    };

    let decoded = urlencoding::decode(&last)
        .map(|s| s.into_owned())
        .unwrap_or(last);

    if decoded.is_empty() {
        "download".to_string()
    } else {
        decoded
    }
}

/// Fetch `url` and write it into `dest_dir`. Returns the written path.
pub async fn download(client: &Client, url: &str, dest_dir: &Path, name: Option<&str>) -> Result<PathBuf> {
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        bail!("{}", resp.status());
    }
    let bytes = resp.bytes().await?;

    let file_name = name
        .map(String::from)
        .unwrap_or_else(|| filename_from_url(url));
    // Never let a server-supplied name escape the destination directory
    let file_name = Path::new(&file_name)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "download".into());

    tokio::fs::create_dir_all(dest_dir).await?;
    let path = dest_dir.join(file_name);
    tokio::fs::write(&path, &bytes).await?;

    tracing::info!("Saved {} ({} bytes) to {:?}", url, bytes.len(), path);
    Ok(path)
}
