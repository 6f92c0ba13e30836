use crate::GenerateError;
use futures::stream::{self, Stream};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use url::Url;

/// Chunked byte stream shared by the renderer, the tee, and the cache.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, GenerateError>> + Send>>;

pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Stream the contents of an open file in fixed-size chunks.
pub fn file_chunks(file: tokio::fs::File) -> ByteStream {
    Box::pin(stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), Some(file)))
            }
            Err(e) => Some((Err(GenerateError::CacheRead(e.to_string())), None)),
        }
    }))
}

/// Wrap in-memory chunks as a [`ByteStream`].
pub fn chunks_stream(chunks: Vec<Result<Vec<u8>, GenerateError>>) -> ByteStream {
    Box::pin(stream::iter(chunks))
}

pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Parse an absolute http(s) URL.
pub fn validate_url(url: &str) -> Result<Url, GenerateError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(GenerateError::Validation("URL is required".into()));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|e| GenerateError::Validation(format!("invalid URL {trimmed:?}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        "http" | "https" => Err(GenerateError::Validation(format!(
            "URL has no host: {trimmed}"
        ))),
        other => Err(GenerateError::Validation(format!(
            "unsupported URL scheme: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("test.txt"), "test.txt");
        assert_eq!(sanitize_filename("test/file.txt"), "test_file.txt");
        assert_eq!(sanitize_filename("test:file?.txt"), "test_file_.txt");
        assert_eq!(sanitize_filename("test<>file.txt"), "test__file.txt");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.0s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("http://example.com/path?query=value").is_ok());
        assert!(validate_url("  https://example.com  ").is_ok());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("invalid-url").is_err());
        assert!(validate_url("").is_err());
        assert!(validate_url("   ").is_err());
        assert_eq!(
            validate_url("example.com").unwrap_err().kind(),
            crate::ErrorKind::Validation
        );
    }

    #[tokio::test]
    async fn test_file_chunks_reads_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let content: Vec<u8> = (0..(READ_CHUNK_SIZE * 2 + 17)).map(|i| i as u8).collect();
        tokio::fs::write(&path, &content).await.unwrap();

        let file = tokio::fs::File::open(&path).await.unwrap();
        let chunks: Vec<_> = file_chunks(file).collect().await;
        let mut read = Vec::new();
        for chunk in chunks {
            read.extend(chunk.unwrap());
        }
        assert_eq!(read, content);
    }
}
