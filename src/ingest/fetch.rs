use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] ureq::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not an http(s) URL: {0}")]
    BadUrl(String),
}

/// Download `url` into `dest`. Returns the number of bytes written.
pub fn download(url: &str, dest: &Path) -> Result<u64, FetchError> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(FetchError::BadUrl(url.to_string()));
    }
    log::debug!("Fetching {url}");

    let mut response = ureq::get(url).call()?;
    let mut reader = response.body_mut().as_reader();
    let mut file = File::create(dest)?;
    let written = std::io::copy(&mut reader, &mut file)?;

    log::debug!("  {} bytes from {url}", written);
    Ok(written)
}

/// File name for a URL: its last path segment without query or fragment.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let after_scheme = path.split_once("://").map_or(path, |(_, rest)| rest);
    let (_, tail) = after_scheme.split_once('/')?;
    let name = tail.rsplit('/').next()?;
    if name.is_empty() { None } else { Some(name.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://cdn.example.com/music/line%20dance.mp3?sig=abc").as_deref(),
            Some("line%20dance.mp3")
        );
        assert_eq!(file_name_from_url("https://example.com/a/b.wav#t=3").as_deref(), Some("b.wav"));
        assert_eq!(file_name_from_url("https://example.com/"), None);
        assert_eq!(file_name_from_url("https://example.com"), None);
    }

    #[test]
    fn test_rejects_non_http_urls() {
        let dir = tempfile::tempdir().unwrap();
        let result = download("file:///etc/passwd", &dir.path().join("x"));
        assert!(matches!(result, Err(FetchError::BadUrl(_))));
    }
}
