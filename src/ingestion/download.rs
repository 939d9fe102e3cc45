//! Byte-capped source transport.

use std::io::Read;
use std::time::Duration;

use reqwest::Url;

use crate::error::{Error, Result};

const CHUNK_SIZE: usize = 8 * 1024;

/// Fetches the raw bytes of a remote source.
///
/// Implementations must stop reading as soon as more than `budget` bytes arrive and return
/// [`Error::DownloadTooLarge`]; nothing may be persisted on failure.
pub trait SourceFetcher: Send + Sync {
    fn fetch(&self, url: &Url, budget: u64) -> Result<Vec<u8>>;
}

/// HTTP(S) fetcher over a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    /// Build a fetcher whose requests (connect plus body) give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::internal(format!("cannot build http client: {e}")))?;
        Ok(Self { client })
    }
}

impl SourceFetcher for HttpFetcher {
    fn fetch(&self, url: &Url, budget: u64) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| Error::Download {
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::Download {
                message: format!("{url} answered {}", response.status()),
            });
        }
        if let Some(len) = response.content_length() {
            if len > budget {
                tracing::info!(target: "ingest", %url, len, budget, "declared length over budget");
                return Err(Error::DownloadTooLarge { limit: budget });
            }
        }

        let bytes = read_capped(response, budget)?;
        tracing::debug!(target: "ingest", %url, bytes = bytes.len(), "downloaded source");
        Ok(bytes)
    }
}

/// Read `reader` to the end in fixed-size chunks, failing once more than `budget` bytes arrive.
pub fn read_capped<R: Read>(mut reader: R, budget: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(out),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(Error::Download {
                    message: e.to_string(),
                });
            }
        };
        if (out.len() + n) as u64 > budget {
            return Err(Error::DownloadTooLarge { limit: budget });
        }
        out.extend_from_slice(&chunk[..n]);
    }
}

/// Parse `raw` and check it may be fetched.
///
/// Only `http` and `https` are accepted. When `allowed_hosts` is non-empty the host must equal
/// one of its entries or be a subdomain of one.
pub fn validate_url(raw: &str, allowed_hosts: &[String]) -> Result<Url> {
    let invalid = || Error::InvalidParameter {
        name: "url".to_string(),
        value: raw.to_string(),
    };
    let url = Url::parse(raw).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid());
    }
    let host = url.host_str().ok_or_else(invalid)?.to_ascii_lowercase();
    if !allowed_hosts.is_empty()
        && !allowed_hosts.iter().any(|allowed| {
            let allowed = allowed.to_ascii_lowercase();
            host == allowed || host.ends_with(&format!(".{allowed}"))
        })
    {
        tracing::info!(target: "ingest", %host, "host not in allow-list");
        return Err(invalid());
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_budget_reads_everything() {
        let data = vec![7u8; 20_000];
        assert_eq!(read_capped(&data[..], 20_000).unwrap().len(), 20_000);
    }

    #[test]
    fn over_budget_aborts() {
        let data = vec![7u8; 20_001];
        let err = read_capped(&data[..], 20_000).unwrap_err();
        assert!(matches!(err, Error::DownloadTooLarge { limit: 20_000 }));
    }

    #[test]
    fn only_http_urls_are_accepted() {
        assert!(validate_url("https://example.com/a.csv", &[]).is_ok());
        assert!(matches!(
            validate_url("file:///etc/passwd", &[]),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(validate_url("not a url", &[]).is_err());
    }

    #[test]
    fn allow_list_matches_suffixes() {
        let allowed = vec!["data.gouv.fr".to_string()];
        assert!(validate_url("https://static.data.gouv.fr/x.csv", &allowed).is_ok());
        assert!(validate_url("https://data.gouv.fr/x.csv", &allowed).is_ok());
        assert!(validate_url("https://evildata.gouv.fr.example.com/x.csv", &allowed).is_err());
    }
}
