use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveCompression;
use crate::catalog::{DEFAULT_TAP_URL, zoo_spec_query};
use crate::cutout::{
    CutoutBuilder, CutoutService, DEFAULT_HIPS, DEFAULT_SKYVIEW_SIZE_DEG, DEFAULT_SKYVIEW_SURVEY,
};
use crate::domain::{CatalogName, ImageFormat};
use crate::error::CutoutError;
use crate::fetch::RetryPolicy;
use crate::filter::QualityCuts;
use crate::pool::DEFAULT_WORKERS;

pub const DEFAULT_CONFIG_FILE: &str = "zoo-cutouts.json";
pub const DEFAULT_CATALOG_NAME: &str = "zoospec";
pub const DEFAULT_ID_COLUMN: &str = "dr7objid";
pub const DEFAULT_ARCHIVE_NAME: &str = "images";
pub const DEFAULT_QUERY_ROWS: usize = 1000;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub catalog: CatalogSection,
    #[serde(default)]
    pub cuts: QualityCuts,
    #[serde(default)]
    pub cutout: CutoutSection,
    #[serde(default)]
    pub download: DownloadSection,
    #[serde(default)]
    pub archive: ArchiveSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CatalogSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_column: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    #[default]
    Hips2Fits,
    SkyServer,
    SkyView,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CutoutSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hips: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub survey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_deg: Option<f64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DownloadSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ArchiveSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogSettings {
    pub name: CatalogName,
    pub tap_url: String,
    pub query: String,
    pub id_column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CutoutSettings {
    pub service: CutoutService,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

impl CutoutSettings {
    pub fn builder(&self) -> CutoutBuilder {
        CutoutBuilder::new(self.service.clone(), self.width, self.height, self.format)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadSettings {
    pub policy: RetryPolicy,
    pub workers: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveSettings {
    pub name: CatalogName,
    pub compression: ArchiveCompression,
}

impl ArchiveSettings {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, self.compression.file_extension())
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub catalog: CatalogSettings,
    pub cuts: QualityCuts,
    pub cutout: CutoutSettings,
    pub download: DownloadSettings,
    pub archive: ArchiveSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CutoutError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(CutoutError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CutoutError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CutoutError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    /// Like [`ConfigLoader::resolve`], but a missing default file yields the
    /// built-in defaults instead of an error.
    pub fn resolve_or_default(path: Option<&str>) -> Result<ResolvedConfig, CutoutError> {
        match Self::resolve(path) {
            Err(CutoutError::MissingConfig) => Self::resolve_config(Config::default()),
            other => other,
        }
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CutoutError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let catalog = CatalogSettings {
            name: config
                .catalog
                .name
                .as_deref()
                .unwrap_or(DEFAULT_CATALOG_NAME)
                .parse()?,
            tap_url: config
                .catalog
                .tap_url
                .unwrap_or_else(|| DEFAULT_TAP_URL.to_string()),
            query: config
                .catalog
                .query
                .unwrap_or_else(|| zoo_spec_query(DEFAULT_QUERY_ROWS)),
            id_column: config
                .catalog
                .id_column
                .unwrap_or_else(|| DEFAULT_ID_COLUMN.to_string()),
        };
        if catalog.query.trim().is_empty() {
            return Err(CutoutError::InvalidConfig("catalog.query is empty".to_string()));
        }

        validate_cuts(&config.cuts)?;

        let cutout_section = config.cutout;
        let pixel_scale = cutout_section.pixel_scale.unwrap_or(config.cuts.pixel_scale);
        let service = match cutout_section.service.unwrap_or_default() {
            ServiceKind::Hips2Fits => CutoutService::Hips2Fits {
                hips: cutout_section
                    .hips
                    .unwrap_or_else(|| DEFAULT_HIPS.to_string()),
            },
            ServiceKind::SkyServer => CutoutService::SkyServer { pixel_scale },
            ServiceKind::SkyView => {
                let size_deg = cutout_section.size_deg.unwrap_or(DEFAULT_SKYVIEW_SIZE_DEG);
                if !(size_deg.is_finite() && size_deg > 0.0) {
                    return Err(CutoutError::InvalidConfig(
                        "cutout.size_deg must be a positive number of degrees".to_string(),
                    ));
                }
                CutoutService::SkyView {
                    survey: cutout_section
                        .survey
                        .unwrap_or_else(|| DEFAULT_SKYVIEW_SURVEY.to_string()),
                    size_deg,
                }
            }
        };
        let cutout = CutoutSettings {
            service,
            width: cutout_section.width.unwrap_or(64),
            height: cutout_section.height.unwrap_or(64),
            format: cutout_section.format.unwrap_or(ImageFormat::Jpg),
        };
        if cutout.width == 0 || cutout.height == 0 {
            return Err(CutoutError::InvalidConfig(
                "cutout width and height must be at least 1".to_string(),
            ));
        }
        if pixel_scale <= 0.0 {
            return Err(CutoutError::InvalidConfig(
                "cutout.pixel_scale must be positive".to_string(),
            ));
        }

        let defaults = RetryPolicy::default();
        let policy = RetryPolicy {
            max_retries: config.download.max_retries.unwrap_or(defaults.max_retries),
            delay: seconds(config.download.delay_secs, defaults.delay, "download.delay_secs")?,
            timeout: seconds(
                config.download.timeout_secs,
                defaults.timeout,
                "download.timeout_secs",
            )?,
        };
        if policy.max_retries == 0 {
            return Err(CutoutError::InvalidConfig(
                "download.max_retries must be at least 1".to_string(),
            ));
        }
        let workers = config.download.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(CutoutError::InvalidConfig(
                "download.workers must be at least 1".to_string(),
            ));
        }
        let download = DownloadSettings {
            policy,
            workers,
            limit: config.download.limit,
        };

        let archive = ArchiveSettings {
            name: config
                .archive
                .name
                .as_deref()
                .unwrap_or(DEFAULT_ARCHIVE_NAME)
                .parse()
                .map_err(|_| {
                    CutoutError::InvalidConfig("archive.name is not a valid file stem".to_string())
                })?,
            compression: if config.archive.compress.unwrap_or(false) {
                ArchiveCompression::Gzip
            } else {
                ArchiveCompression::None
            },
        };

        Ok(ResolvedConfig {
            schema_version,
            catalog,
            cuts: config.cuts,
            cutout,
            download,
            archive,
        })
    }

    /// Every setting spelled out with its default value.
    pub fn default_config() -> Config {
        let policy = RetryPolicy::default();
        Config {
            schema_version: Some(1),
            catalog: CatalogSection {
                name: Some(DEFAULT_CATALOG_NAME.to_string()),
                tap_url: Some(DEFAULT_TAP_URL.to_string()),
                query: Some(zoo_spec_query(DEFAULT_QUERY_ROWS)),
                id_column: Some(DEFAULT_ID_COLUMN.to_string()),
            },
            cuts: QualityCuts::default(),
            cutout: CutoutSection {
                service: Some(ServiceKind::Hips2Fits),
                hips: Some(DEFAULT_HIPS.to_string()),
                width: Some(64),
                height: Some(64),
                format: Some(ImageFormat::Jpg),
                pixel_scale: Some(QualityCuts::default().pixel_scale),
                survey: Some(DEFAULT_SKYVIEW_SURVEY.to_string()),
                size_deg: Some(DEFAULT_SKYVIEW_SIZE_DEG),
            },
            download: DownloadSection {
                max_retries: Some(policy.max_retries),
                delay_secs: Some(policy.delay.as_secs_f64()),
                timeout_secs: Some(policy.timeout.as_secs_f64()),
                workers: Some(DEFAULT_WORKERS),
                limit: None,
            },
            archive: ArchiveSection {
                name: Some(DEFAULT_ARCHIVE_NAME.to_string()),
                compress: Some(false),
            },
        }
    }

    /// Writes [`ConfigLoader::default_config`] as pretty JSON. An existing
    /// file is only replaced with `force`.
    pub fn write_default(path: &Path, force: bool) -> Result<(), CutoutError> {
        if path.exists() && !force {
            return Err(CutoutError::InvalidConfig(format!(
                "{} already exists (use --force to overwrite)",
                path.display()
            )));
        }
        let mut content = serde_json::to_vec_pretty(&Self::default_config())
            .map_err(|err| CutoutError::ConfigParse(err.to_string()))?;
        content.push(b'\n');
        fs::write(path, content).map_err(|err| CutoutError::Filesystem(err.to_string()))
    }
}

fn validate_cuts(cuts: &QualityCuts) -> Result<(), CutoutError> {
    if cuts.pixel_scale <= 0.0 {
        return Err(CutoutError::InvalidConfig("cuts.pixel_scale must be positive".to_string()));
    }
    if cuts.min_size_px >= cuts.max_size_px {
        return Err(CutoutError::InvalidConfig(
            "cuts.min_size_px must be below cuts.max_size_px".to_string(),
        ));
    }
    Ok(())
}

fn seconds(value: Option<f64>, default: Duration, field: &str) -> Result<Duration, CutoutError> {
    match value {
        None => Ok(default),
        Some(secs) => Duration::try_from_secs_f64(secs).map_err(|_| {
            CutoutError::InvalidConfig(format!(
                "{field} must be a non-negative number of seconds, got {secs}"
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn empty_config_resolves_to_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.catalog.name.as_str(), "zoospec");
        assert_eq!(resolved.catalog.id_column, "dr7objid");
        assert_eq!(resolved.download.policy, RetryPolicy::default());
        assert_eq!(resolved.download.workers, 5);
        assert_eq!(resolved.archive.file_name(), "images.tar");
        assert_eq!(resolved.cutout.width, 64);
    }

    #[test]
    fn zero_workers_is_invalid() {
        let config = Config {
            download: DownloadSection {
                workers: Some(0),
                ..DownloadSection::default()
            },
            ..Config::default()
        };
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, CutoutError::InvalidConfig(_));
    }

    #[test]
    fn written_default_reads_back() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(DEFAULT_CONFIG_FILE);
        ConfigLoader::write_default(&path, false).unwrap();
        let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
        assert_eq!(resolved.download.policy.delay, Duration::from_secs(2));

        let err = ConfigLoader::write_default(&path, false).unwrap_err();
        assert_matches!(err, CutoutError::InvalidConfig(_));
    }
}
