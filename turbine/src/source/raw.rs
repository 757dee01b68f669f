//! The `raw` source fetcher: materializes a `file://` or `http(s)://` tar/tar.gz archive into a
//! fresh local directory.

use super::{SourceFetchError, SourceFetcher};
use crate::model::Source;
use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use futures::TryStreamExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, BufReader};
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::io::StreamReader;

#[derive(Debug, Default)]
pub struct RawFetcher;

impl RawFetcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SourceFetcher for RawFetcher {
    async fn fetch(&self, source: &Source) -> Result<PathBuf, SourceFetchError> {
        let dest = std::env::temp_dir().join(format!("turbine-src-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dest)
            .await
            .map_err(|e| SourceFetchError::Fetch(e.to_string()))?;

        let gzip = source.uri.ends_with(".tgz") || source.uri.ends_with(".tar.gz");

        if let Some(path) = source.uri.strip_prefix("file://") {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| SourceFetchError::Fetch(format!("could not open '{path}'; {e}")))?;
            let reader = BufReader::new(file);

            if gzip {
                unpack(GzipDecoder::new(reader), &dest).await?;
            } else {
                unpack(reader, &dest).await?;
            }

            return Ok(dest);
        }

        if source.uri.starts_with("http://") || source.uri.starts_with("https://") {
            let response = reqwest::get(&source.uri)
                .await
                .map_err(|e| SourceFetchError::Fetch(e.to_string()))?
                .error_for_status()
                .map_err(|e| SourceFetchError::Fetch(e.to_string()))?;

            let byte_stream = response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
            let reader = BufReader::new(StreamReader::new(byte_stream));

            if gzip {
                unpack(GzipDecoder::new(reader), &dest).await?;
            } else {
                unpack(reader, &dest).await?;
            }

            return Ok(dest);
        }

        Err(SourceFetchError::Fetch(format!(
            "unsupported uri scheme in '{}'; expected file://, http:// or https://",
            source.uri
        )))
    }
}

async fn unpack<R>(reader: R, dest: &Path) -> Result<(), SourceFetchError>
where
    R: AsyncRead + Unpin + Send,
{
    let archive = async_tar::Archive::new(reader.compat());
    archive
        .unpack(dest)
        .await
        .map_err(|e| SourceFetchError::MalformedArchive(e.to_string()))
}
