use std::io::{self, Write};
use std::path::Path;

use bytes::Bytes;

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to store the response body from {url}")]
    Io {
        url: String,
        #[source]
        source: io::Error,
    },
}

/// Retrieves remote artifacts over HTTP(S).
#[async_trait::async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;

    /// Download `url` into a new file at `dest`, returning the number of bytes written.
    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let body = self.fetch(url).await?;
        let io_err = |source| FetchError::Io {
            url: url.to_owned(),
            source,
        };
        let mut file = std::fs::File::create_new(dest).map_err(io_err)?;
        file.write_all(&body).map_err(io_err)?;
        Ok(body.len() as u64)
    }
}

pub fn http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("ki/{}", env!("CARGO_PKG_VERSION")))
        .build()
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let response = self.client.get(url).send().await.map_err(|source| FetchError::Transport {
            url: url.to_owned(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        tracing::info!("Downloading {url}");
        self.get(url).await?.bytes().await.map_err(|source| FetchError::Transport {
            url: url.to_owned(),
            source,
        })
    }

    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        tracing::info!("Downloading {url}");
        let mut response = self.get(url).await?;
        let io_err = |source| FetchError::Io {
            url: url.to_owned(),
            source,
        };
        let mut file = std::fs::File::create_new(dest).map_err(io_err)?;
        let mut written = 0;
        while let Some(chunk) = response.chunk().await.map_err(|source| FetchError::Transport {
            url: url.to_owned(),
            source,
        })? {
            file.write_all(&chunk).map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.sync_all().map_err(io_err)?;
        Ok(written)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::{Fetch, FetchError};

    /// Serves canned bodies by URL and counts requests. Unknown URLs answer 404.
    #[derive(Default)]
    pub(crate) struct StaticFetcher {
        bodies: HashMap<String, Bytes>,
        requests: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn serve(mut self, url: &str, body: impl Into<Bytes>) -> Self {
            self.bodies.insert(url.to_owned(), body.into());
            self
        }

        pub(crate) fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Fetch for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            self.requests.lock().unwrap().push(url.to_owned());
            self.bodies.get(url).cloned().ok_or_else(|| FetchError::Status {
                url: url.to_owned(),
                status: 404,
            })
        }
    }
}
