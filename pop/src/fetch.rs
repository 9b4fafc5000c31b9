//! This module provides the network side of fragment transfers.
//!
//! A [`Fetcher`] turns a fragment URL into an owned binary buffer. The [`TransferScheduler`](crate::transfer::TransferScheduler)
//! only ever sees this trait, so the transport can be swapped for HTTP ([`HttpFetcher`]), a local directory ([`FileFetcher`]) or a test double.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio::{fs, io};

pub use reqwest::Client;
pub use url::Url;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

/// Fetch interface to the network/runtime layer.
///
/// The returned future must be `'static` so that it can be moved onto a background task once the transfer is admitted.
pub trait Fetcher: Send + Sync + 'static {
    /// Fetch `url` into an owned buffer.
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Bytes, Error>>;
}

/// A fetcher issuing HTTP `GET` requests.
#[derive(Debug, Default)]
pub struct HttpFetcher {
    client: Client,
    base: Option<Url>,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    /// Resolve relative fragment URLs against `base`.
    #[inline]
    pub fn with_base(self, base: Url) -> Self {
        Self { base: Some(base), ..self }
    }

    fn resolve(&self, url: &str) -> Result<Url, Error> {
        Ok(match self.base {
            Some(ref base) => base.join(url)?,
            None => Url::parse(url)?,
        })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Bytes, Error>> {
        let client = self.client.clone();
        let url = self.resolve(url);

        async move {
            let resp = client.get(url?).send().await?.error_for_status()?;

            Ok::<_, Error>(resp.bytes().await?)
        }
        .boxed()
    }
}

/// A fetcher reading fragments from a local directory.
///
/// Fragment URLs are interpreted as paths relative to the root directory.
#[derive(Debug)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        self.root.as_path()
    }
}

impl Fetcher for FileFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Bytes, Error>> {
        let path = self.root.join(url.trim_start_matches('/'));

        async move {
            tracing::trace!("Reading fragment from local storage: `{}`", path.display());

            Ok::<_, Error>(Bytes::from(fs::read(&path).await?))
        }
        .boxed()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_fetcher() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("level0.bin"), [0x12u8, 0x34]).unwrap();

        let fetcher = FileFetcher::new(dir.path().to_path_buf());

        assert_eq!(fetcher.fetch("/level0.bin").await.unwrap().as_ref(), [0x12, 0x34]);
        assert!(matches!(fetcher.fetch("missing.bin").await, Err(Error::Io(_))));
    }

    #[test]
    fn test_http_fetcher_resolve() {
        let fetcher = HttpFetcher::new();
        assert!(matches!(fetcher.resolve("level0.bin"), Err(Error::Url(_))));

        let fetcher = fetcher.with_base(Url::parse("http://localhost/models/bunny/").unwrap());
        assert_eq!(
            fetcher.resolve("level0.bin").unwrap().as_str(),
            "http://localhost/models/bunny/level0.bin"
        );
    }

    #[tokio::test]
    #[should_panic(expected = "transfer of `never.bin` was never issued")]
    async fn test_manual_fetcher_resolve_times_out() {
        testing::ManualFetcher::default().succeed("never.bin", b"").await;
    }

    #[tokio::test]
    async fn test_http_fetcher_invalid_url() {
        let fetcher = HttpFetcher::new();

        assert!(matches!(fetcher.fetch("not a url").await, Err(Error::Url(_))));
    }
}
