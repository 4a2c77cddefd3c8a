//! Version listing and server jar download for each engine type.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::instance::EngineType;

const MOJANG_MANIFEST: &str = "https://launchermeta.mojang.com/mc/game/version_manifest.json";
const PAPER_API: &str = "https://api.papermc.io/v2/projects/paper";
const PURPUR_API: &str = "https://api.purpurmc.org/v2/purpur";
const FABRIC_META: &str = "https://meta.fabricmc.net/v2/versions";

// ─── API payloads ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MojangManifest {
    versions: Vec<MojangVersion>,
}

#[derive(Debug, Deserialize)]
struct MojangVersion {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct MojangVersionDetail {
    downloads: MojangDownloads,
}

#[derive(Debug, Deserialize)]
struct MojangDownloads {
    server: Option<MojangArtifact>,
}

#[derive(Debug, Deserialize)]
struct MojangArtifact {
    url: String,
}

/// Paper and Purpur share the `{ "versions": [...] }` project shape.
#[derive(Debug, Deserialize)]
struct ProjectVersions {
    versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PaperBuilds {
    builds: Vec<PaperBuild>,
}

#[derive(Debug, Deserialize)]
struct PaperBuild {
    build: u32,
    #[serde(default)]
    channel: String,
    downloads: PaperBuildDownloads,
}

#[derive(Debug, Deserialize)]
struct PaperBuildDownloads {
    application: PaperApplication,
}

#[derive(Debug, Deserialize)]
struct PaperApplication {
    name: String,
}

#[derive(Debug, Deserialize)]
struct FabricVersion {
    version: String,
    stable: bool,
}

// ─── Parsers (pure, newest first) ───────────────────────────

fn vanilla_releases(manifest: &MojangManifest) -> Vec<String> {
    manifest
        .versions
        .iter()
        .filter(|v| v.kind == "release")
        .map(|v| v.id.clone())
        .collect()
}

fn project_releases(project: ProjectVersions) -> Vec<String> {
    // 프로젝트 API 는 오래된 순으로 반환, 최신 순으로 뒤집고 프리릴리스 제외
    project
        .versions
        .into_iter()
        .rev()
        .filter(|v| !v.contains("-pre") && !v.contains("-rc"))
        .collect()
}

fn fabric_stable(versions: &[FabricVersion]) -> Vec<String> {
    versions.iter().filter(|v| v.stable).map(|v| v.version.clone()).collect()
}

fn latest_paper_build(builds: &PaperBuilds) -> Option<&PaperBuild> {
    builds
        .builds
        .iter()
        .filter(|b| b.channel.is_empty() || b.channel == "default")
        .max_by_key(|b| b.build)
        .or_else(|| builds.builds.iter().max_by_key(|b| b.build))
}

// ─── Catalog ─────────────────────────────────────────────────

/// HTTP client for the public engine version APIs.
pub struct VersionCatalog {
    http: reqwest::Client,
}

impl Default for VersionCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionCatalog {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("minegimme-core/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { http }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.http.get(url).send().await.with_context(|| format!("GET {}", url))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} returned {}: {}", url, status, body);
        }
        Ok(response.json().await?)
    }

    /// Release versions for one engine, newest first.
    pub async fn list(&self, engine: EngineType) -> Result<Vec<String>> {
        match engine {
            EngineType::Vanilla => {
                let manifest: MojangManifest = self.get_json(MOJANG_MANIFEST).await?;
                Ok(vanilla_releases(&manifest))
            }
            EngineType::Paper => Ok(project_releases(self.get_json(PAPER_API).await?)),
            EngineType::Purpur => Ok(project_releases(self.get_json(PURPUR_API).await?)),
            EngineType::Fabric => {
                let games: Vec<FabricVersion> =
                    self.get_json(&format!("{}/game", FABRIC_META)).await?;
                Ok(fabric_stable(&games))
            }
        }
    }

    /// Resolve the direct download URL of the server jar.
    pub async fn download_url(&self, engine: EngineType, version: &str) -> Result<String> {
        match engine {
            EngineType::Vanilla => {
                let manifest: MojangManifest = self.get_json(MOJANG_MANIFEST).await?;
                let entry = manifest
                    .versions
                    .iter()
                    .find(|v| v.id == version)
                    .ok_or_else(|| anyhow::anyhow!("unknown vanilla version '{}'", version))?;
                let detail: MojangVersionDetail = self.get_json(&entry.url).await?;
                detail
                    .downloads
                    .server
                    .map(|s| s.url)
                    .ok_or_else(|| anyhow::anyhow!("version '{}' has no server download", version))
            }
            EngineType::Paper => {
                let builds: PaperBuilds = self
                    .get_json(&format!("{}/versions/{}/builds", PAPER_API, version))
                    .await?;
                let build = latest_paper_build(&builds)
                    .ok_or_else(|| anyhow::anyhow!("no paper builds for '{}'", version))?;
                Ok(format!(
                    "{}/versions/{}/builds/{}/downloads/{}",
                    PAPER_API, version, build.build, build.downloads.application.name
                ))
            }
            EngineType::Purpur => Ok(format!("{}/{}/latest/download", PURPUR_API, version)),
            EngineType::Fabric => {
                let loaders: Vec<FabricVersion> =
                    self.get_json(&format!("{}/loader", FABRIC_META)).await?;
                let installers: Vec<FabricVersion> =
                    self.get_json(&format!("{}/installer", FABRIC_META)).await?;
                let loader = fabric_stable(&loaders)
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("no stable fabric loader"))?;
                let installer = fabric_stable(&installers)
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("no stable fabric installer"))?;
                Ok(format!(
                    "{}/loader/{}/{}/{}/server/jar",
                    FABRIC_META, version, loader, installer
                ))
            }
        }
    }

    /// Download the server jar to `dest`, replacing any existing file. Returns the size in bytes.
    pub async fn download_jar(&self, engine: EngineType, version: &str, dest: &Path) -> Result<u64> {
        let url = self.download_url(engine, version).await?;
        tracing::info!("Downloading {} {} from {}", engine, version, url);

        let response = self.http.get(&url).send().await.with_context(|| format!("GET {}", url))?;
        if !response.status().is_success() {
            anyhow::bail!("{} returned {}", url, response.status());
        }
        let body = response.bytes().await?;

        // 임시 파일에 쓴 뒤 교체. 중간에 실패해도 기존 jar 유지
        let tmp = dest.with_extension("jar.part");
        let mut out = tokio::fs::File::create(&tmp).await?;
        out.write_all(&body).await?;
        out.flush().await?;
        drop(out);
        tokio::fs::rename(&tmp, dest).await?;
        Ok(body.len() as u64)
    }
}
