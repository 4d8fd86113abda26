//! Best-effort concurrent artifact retrieval

use crate::transport::ControlPlaneClient;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Per-artifact result; failures carry no structured error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub artifact: String,
    pub file_name: Option<String>,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct SoftwareFetcher {
    client: ControlPlaneClient,
    download_dir: PathBuf,
}

impl SoftwareFetcher {
    pub fn new(client: ControlPlaneClient, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            download_dir: download_dir.into(),
        }
    }

    /// Resolve every id, then download all resolved URLs concurrently.
    ///
    /// Returns once every download has finished, one report per id.
    pub async fn fetch(&self, ids: &[String]) -> Vec<DownloadReport> {
        let mut reports = Vec::with_capacity(ids.len());
        let mut downloads = JoinSet::new();

        for id in ids.iter().map(|id| id.trim()).filter(|id| !id.is_empty()) {
            match self.client.artifact_url(id).await {
                Ok(Some(url)) => {
                    let client = self.client.clone();
                    let dir = self.download_dir.clone();
                    let artifact = id.to_string();
                    downloads.spawn(async move { download(&client, &dir, artifact, url).await });
                }
                Ok(None) => {
                    info!("Url doesn't exist for software {}", id);
                    reports.push(failed(id));
                }
                Err(e) => {
                    info!("Can't resolve software {}: {:#}", id, e);
                    reports.push(failed(id));
                }
            }
        }

        while let Some(joined) = downloads.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Download task failed: {}", e),
            }
        }
        reports
    }

    /// True when every id was fetched
    pub async fn ensure(&self, ids: &[String]) -> bool {
        if ids.is_empty() {
            return true;
        }
        let reports = self.fetch(ids).await;
        reports.len() == ids.len() && reports.iter().all(|r| r.success)
    }
}

fn failed(artifact: &str) -> DownloadReport {
    DownloadReport {
        artifact: artifact.to_string(),
        file_name: None,
        success: false,
    }
}

async fn download(
    client: &ControlPlaneClient,
    dir: &Path,
    artifact: String,
    url: String,
) -> DownloadReport {
    let file_name = file_name_from_url(&url);

    let result: Result<()> = async {
        let bytes = client.download(&url).await?;
        tokio::fs::write(dir.join(&file_name), bytes).await?;
        Ok(())
    }
    .await;

    if let Err(e) = &result {
        info!("Download of {} failed: {:#}", url, e);
    }
    info!("Download file: {}, status: {}", file_name, result.is_ok());

    DownloadReport {
        artifact,
        file_name: result.is_ok().then_some(file_name),
        success: result.is_ok(),
    }
}

/// Last path segment of `url`, or `default_name_<unix>` if there is none
pub fn file_name_from_url(url: &str) -> String {
    url.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("default_name_{}", chrono::Utc::now().timestamp()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoints, ServiceAddr};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("http://repo/files/tool.ipk"), "tool.ipk");
        assert!(file_name_from_url("http://repo/files/").starts_with("default_name_"));
        assert!(file_name_from_url("").starts_with("default_name_"));
    }

    #[tokio::test]
    async fn test_fetch_is_independent_per_artifact() {
        let server = MockServer::start().await;
        let base = server.uri();

        Mock::given(method("GET"))
            .and(path("/api/v1.0/repo/good"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"url": format!("{base}/files/good.bin")})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1.0/repo/broken"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"url": format!("{base}/files/broken.bin")})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/good.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/broken.bin"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let a = server.address();
        let addr = ServiceAddr::new(a.ip().to_string(), a.port());
        let client = ControlPlaneClient::new(
            Endpoints {
                server: addr.clone(),
                repo: addr,
            },
            Duration::from_secs(2),
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let fetcher = SoftwareFetcher::new(client, dir.path());

        let ids = vec!["good".to_string(), "broken".to_string(), "missing".to_string()];
        let mut reports = fetcher.fetch(&ids).await;
        reports.sort_by(|a, b| a.artifact.cmp(&b.artifact));

        assert_eq!(reports.len(), 3);
        assert!(!reports[0].success); // broken
        assert!(reports[1].success); // good
        assert!(!reports[2].success); // missing
        assert_eq!(
            std::fs::read(dir.path().join("good.bin")).unwrap(),
            b"payload"
        );

        assert!(!fetcher.ensure(&ids).await);
        assert!(fetcher.ensure(&["good".to_string()]).await);
        assert!(fetcher.ensure(&[]).await);
    }
}
