//! Installation of provider plugin binaries.
//!
//! Plugins are downloaded from the HashiCorp release site into a per-user
//! install directory and reused across runs. Binaries follow the naming
//! convention `terraform-provider-<name>_v<version>_x<protocol>`.

use std::fs;
use std::io::{Cursor, Read};
use std::path::PathBuf;

use semver::{Version, VersionReq};
use thiserror::Error;
use tracing::{debug, info};

const RELEASES_BASE_URL: &str = "https://releases.hashicorp.com";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("cannot determine home directory")]
    NoHomeDir,

    #[error("invalid version constraint '{constraint}': {source}")]
    Constraint {
        constraint: String,
        source: semver::Error,
    },

    #[error("no release of provider '{name}' satisfies '{constraint}'")]
    NoMatchingVersion { name: String, constraint: String },

    #[error("failed to fetch {url}: {source}")]
    Fetch { url: String, source: reqwest::Error },

    #[error("fetching {url} failed with status {status}")]
    FetchStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("release archive for provider '{0}' contains no plugin binary")]
    NoBinaryInArchive(String),

    #[error("failed to unpack release archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata of an installed plugin binary.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginMeta {
    pub name: String,
    pub version: Version,
    pub path: PathBuf,
}

/// Returns the default plugin install directory, `~/.terradozer`.
pub fn default_install_dir() -> Result<PathBuf, InstallError> {
    dirs::home_dir()
        .map(|home| home.join(".terradozer"))
        .ok_or(InstallError::NoHomeDir)
}

/// Downloads and caches provider plugin binaries.
pub struct ProviderInstaller {
    client: reqwest::Client,
    base_url: String,
    install_dir: PathBuf,
}

impl ProviderInstaller {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self::with_base_url(install_dir, RELEASES_BASE_URL.to_string())
    }

    /// Creates an installer resolving releases against a custom base URL
    /// (for testing).
    pub fn with_base_url(install_dir: impl Into<PathBuf>, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            install_dir: install_dir.into(),
        }
    }

    /// Installs the newest release of a provider that satisfies the version
    /// constraint, reusing an already installed binary when one matches.
    /// Older versions of the same provider are pruned afterwards.
    pub async fn install(
        &self,
        name: &str,
        version_constraint: &str,
    ) -> Result<PluginMeta, InstallError> {
        let constraint =
            VersionReq::parse(version_constraint).map_err(|source| InstallError::Constraint {
                constraint: version_constraint.to_string(),
                source,
            })?;

        fs::create_dir_all(&self.install_dir)?;

        if let Some(meta) = self.installed_plugin(name, &constraint)? {
            info!(name = %meta.name, version = %meta.version, "using already installed provider");
            return Ok(meta);
        }

        let version = self.resolve_version(name, &constraint, version_constraint).await?;
        let meta = self.download(name, &version).await?;
        self.prune_older_versions(&meta)?;

        info!(name = %meta.name, version = %meta.version, "downloaded and installed provider");
        Ok(meta)
    }

    /// Scans the install directory for the newest binary of the given
    /// provider satisfying the constraint.
    fn installed_plugin(
        &self,
        name: &str,
        constraint: &VersionReq,
    ) -> Result<Option<PluginMeta>, InstallError> {
        let mut best: Option<PluginMeta> = None;
        for entry in fs::read_dir(&self.install_dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(version) = parse_binary_version(&file_name, name) else {
                continue;
            };
            if !constraint.matches(&version) {
                continue;
            }
            if best.as_ref().map_or(true, |meta| version > meta.version) {
                best = Some(PluginMeta {
                    name: name.to_string(),
                    version,
                    path: entry.path(),
                });
            }
        }
        Ok(best)
    }

    /// Resolves the newest released version satisfying the constraint from
    /// the release index.
    async fn resolve_version(
        &self,
        name: &str,
        constraint: &VersionReq,
        constraint_display: &str,
    ) -> Result<Version, InstallError> {
        let url = format!("{}/terraform-provider-{}/index.json", self.base_url, name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| InstallError::Fetch {
                url: url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(InstallError::FetchStatus {
                url,
                status: response.status(),
            });
        }

        let index: ReleaseIndex =
            response
                .json()
                .await
                .map_err(|source| InstallError::Fetch {
                    url: url.clone(),
                    source,
                })?;

        index
            .versions
            .keys()
            .filter_map(|raw| Version::parse(raw).ok())
            .filter(|version| constraint.matches(version))
            .max()
            .ok_or_else(|| InstallError::NoMatchingVersion {
                name: name.to_string(),
                constraint: constraint_display.to_string(),
            })
    }

    async fn download(&self, name: &str, version: &Version) -> Result<PluginMeta, InstallError> {
        let (os, arch) = release_platform();
        let url = format!(
            "{base}/terraform-provider-{name}/{version}/terraform-provider-{name}_{version}_{os}_{arch}.zip",
            base = self.base_url,
        );
        debug!(%url, "downloading provider release");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| InstallError::Fetch {
                url: url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(InstallError::FetchStatus {
                url,
                status: response.status(),
            });
        }
        let archive = response
            .bytes()
            .await
            .map_err(|source| InstallError::Fetch {
                url: url.clone(),
                source,
            })?;

        let (binary_name, contents) = extract_plugin_binary(&archive, name)?;
        let path = self.install_dir.join(&binary_name);
        fs::write(&path, contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }

        Ok(PluginMeta {
            name: name.to_string(),
            version: version.clone(),
            path,
        })
    }

    /// Removes binaries of the same provider older than the one just
    /// installed.
    fn prune_older_versions(&self, keep: &PluginMeta) -> Result<(), InstallError> {
        for entry in fs::read_dir(&self.install_dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(version) = parse_binary_version(&file_name, &keep.name) else {
                continue;
            };
            if version < keep.version {
                debug!(file = %file_name, "pruning older provider binary");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct ReleaseIndex {
    versions: std::collections::BTreeMap<String, serde_json::Value>,
}

/// Parses the version out of a plugin binary name such as
/// `terraform-provider-aws_v2.68.0_x4`.
fn parse_binary_version(file_name: &str, name: &str) -> Option<Version> {
    let rest = file_name.strip_prefix(&format!("terraform-provider-{name}_v"))?;
    let version = rest.split("_x").next()?;
    Version::parse(version).ok()
}

fn extract_plugin_binary(archive: &[u8], name: &str) -> Result<(String, Vec<u8>), InstallError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;
    let prefix = format!("terraform-provider-{name}");
    for index in 0..zip.len() {
        let mut file = zip.by_index(index)?;
        if !file.name().starts_with(&prefix) {
            continue;
        }
        let binary_name = file.name().to_string();
        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)?;
        return Ok((binary_name, contents));
    }
    Err(InstallError::NoBinaryInArchive(name.to_string()))
}

/// Maps the host platform to the naming used by the release archives.
fn release_platform() -> (&'static str, &'static str) {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        other => other,
    };
    (os, arch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binary_version() {
        assert_eq!(
            parse_binary_version("terraform-provider-aws_v2.68.0_x4", "aws"),
            Some(Version::new(2, 68, 0))
        );
        assert_eq!(
            parse_binary_version("terraform-provider-aws_v2.68.0", "aws"),
            Some(Version::new(2, 68, 0))
        );
        assert_eq!(
            parse_binary_version("terraform-provider-aws_v2.68.0_x4", "google"),
            None
        );
        assert_eq!(parse_binary_version("some-other-file", "aws"), None);
        assert_eq!(
            parse_binary_version("terraform-provider-aws_vgarbage_x4", "aws"),
            None
        );
    }

    #[test]
    fn test_installed_plugin_picks_newest_match() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "terraform-provider-aws_v2.60.0_x4",
            "terraform-provider-aws_v2.68.0_x4",
            "terraform-provider-google_v3.11.0_x5",
        ] {
            fs::write(dir.path().join(name), b"binary").unwrap();
        }

        let installer = ProviderInstaller::new(dir.path());
        let constraint = VersionReq::parse(">=2.0.0, <3.0.0").unwrap();
        let meta = installer.installed_plugin("aws", &constraint).unwrap().unwrap();
        assert_eq!(meta.version, Version::new(2, 68, 0));

        let pinned = VersionReq::parse("=2.60.0").unwrap();
        let meta = installer.installed_plugin("aws", &pinned).unwrap().unwrap();
        assert_eq!(meta.version, Version::new(2, 60, 0));

        let unsatisfied = VersionReq::parse("=9.9.9").unwrap();
        assert!(installer.installed_plugin("aws", &unsatisfied).unwrap().is_none());
    }

    #[test]
    fn test_prune_older_versions() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "terraform-provider-aws_v2.60.0_x4",
            "terraform-provider-aws_v2.68.0_x4",
            "terraform-provider-google_v3.11.0_x5",
        ] {
            fs::write(dir.path().join(name), b"binary").unwrap();
        }

        let installer = ProviderInstaller::new(dir.path());
        let keep = PluginMeta {
            name: "aws".to_string(),
            version: Version::new(2, 68, 0),
            path: dir.path().join("terraform-provider-aws_v2.68.0_x4"),
        };
        installer.prune_older_versions(&keep).unwrap();

        assert!(!dir.path().join("terraform-provider-aws_v2.60.0_x4").exists());
        assert!(dir.path().join("terraform-provider-aws_v2.68.0_x4").exists());
        assert!(dir.path().join("terraform-provider-google_v3.11.0_x5").exists());
    }

    #[test]
    fn test_extract_plugin_binary() {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options = zip::write::FileOptions::default();
            writer
                .start_file("terraform-provider-aws_v2.68.0_x4", options)
                .unwrap();
            std::io::Write::write_all(&mut writer, b"#!plugin").unwrap();
            writer.finish().unwrap();
        }

        let (name, contents) = extract_plugin_binary(&buf, "aws").unwrap();
        assert_eq!(name, "terraform-provider-aws_v2.68.0_x4");
        assert_eq!(contents, b"#!plugin");

        assert!(matches!(
            extract_plugin_binary(&buf, "google"),
            Err(InstallError::NoBinaryInArchive(_))
        ));
    }
}
