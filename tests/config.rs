use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use zoo_cutouts::archive::ArchiveCompression;
use zoo_cutouts::config::{Config, ConfigLoader};
use zoo_cutouts::cutout::CutoutService;
use zoo_cutouts::domain::ImageFormat;
use zoo_cutouts::error::CutoutError;

fn resolve_json(json: &str) -> Result<zoo_cutouts::config::ResolvedConfig, CutoutError> {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("zoo-cutouts.json");
    fs::write(&path, json).unwrap();
    ConfigLoader::resolve(path.to_str())
}

#[test]
fn json_overrides_defaults_section_by_section() {
    let resolved = resolve_json(
        r#"{
            "catalog": { "name": "zoo-small", "query": "SELECT TOP 10 * FROM zoospec" },
            "cuts": { "min_confidence": 0.8, "max_size_px": 128 },
            "cutout": { "width": 128, "height": 96, "format": "png" },
            "download": { "max_retries": 3, "delay_secs": 0.5, "workers": 8, "limit": 40 },
            "archive": { "name": "zoo-small", "compress": true }
        }"#,
    )
    .unwrap();

    assert_eq!(resolved.catalog.name.as_str(), "zoo-small");
    assert_eq!(resolved.catalog.query, "SELECT TOP 10 * FROM zoospec");
    assert_eq!(resolved.catalog.id_column, "dr7objid");
    assert_eq!(resolved.cuts.min_confidence, 0.8);
    assert_eq!(resolved.cuts.max_size_px, 128.0);
    assert_eq!(resolved.cuts.min_size_px, 20.0);
    assert_eq!(resolved.cutout.width, 128);
    assert_eq!(resolved.cutout.height, 96);
    assert_eq!(resolved.cutout.format, ImageFormat::Png);
    assert_eq!(resolved.download.policy.max_retries, 3);
    assert_eq!(resolved.download.policy.delay, Duration::from_millis(500));
    assert_eq!(resolved.download.policy.timeout, Duration::from_secs(30));
    assert_eq!(resolved.download.workers, 8);
    assert_eq!(resolved.download.limit, Some(40));
    assert_eq!(resolved.archive.compression, ArchiveCompression::Gzip);
    assert_eq!(resolved.archive.file_name(), "zoo-small.tar.gz");
}

#[test]
fn skyserver_uses_the_cut_pixel_scale_unless_overridden() {
    let resolved = resolve_json(
        r#"{ "cuts": { "pixel_scale": 0.2 }, "cutout": { "service": "skyserver" } }"#,
    )
    .unwrap();
    assert_eq!(resolved.cutout.service, CutoutService::SkyServer { pixel_scale: 0.2 });

    let resolved = resolve_json(
        r#"{ "cutout": { "service": "skyserver", "pixel_scale": 0.79 } }"#,
    )
    .unwrap();
    assert_eq!(resolved.cutout.service, CutoutService::SkyServer { pixel_scale: 0.79 });
}

#[test]
fn skyview_defaults_to_small_dss_fits_cutouts() {
    let resolved = resolve_json(r#"{ "cutout": { "service": "skyview", "format": "png" } }"#)
        .unwrap();
    assert_eq!(
        resolved.cutout.service,
        CutoutService::SkyView {
            survey: "DSS".to_string(),
            size_deg: 0.03,
        }
    );
    assert_eq!(resolved.cutout.builder().format(), ImageFormat::Fits);

    let resolved = resolve_json(
        r#"{ "cutout": { "service": "skyview", "survey": "SDSSr", "size_deg": 0.1 } }"#,
    )
    .unwrap();
    assert_eq!(
        resolved.cutout.service,
        CutoutService::SkyView {
            survey: "SDSSr".to_string(),
            size_deg: 0.1,
        }
    );

    let err = resolve_json(r#"{ "cutout": { "service": "skyview", "size_deg": 0 } }"#)
        .unwrap_err();
    assert_matches!(err, CutoutError::InvalidConfig(msg) if msg.contains("size_deg"));
}

#[test]
fn missing_explicit_path_is_a_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, CutoutError::ConfigRead(p) if p == path);
}

#[test]
fn malformed_json_is_a_parse_error() {
    let err = resolve_json("{ \"download\": { \"workers\": \"many\" } }").unwrap_err();
    assert_matches!(err, CutoutError::ConfigParse(_));
}

#[test]
fn inverted_size_window_is_rejected() {
    let err = resolve_json(r#"{ "cuts": { "min_size_px": 70 } }"#).unwrap_err();
    assert_matches!(err, CutoutError::InvalidConfig(_));
}

#[test]
fn negative_delay_is_rejected() {
    let err = resolve_json(r#"{ "download": { "delay_secs": -1 } }"#).unwrap_err();
    assert_matches!(err, CutoutError::InvalidConfig(message) if message.contains("delay_secs"));

    let err = resolve_json(r#"{ "download": { "delay_secs": 1e20 } }"#).unwrap_err();
    assert_matches!(err, CutoutError::InvalidConfig(message) if message.contains("delay_secs"));

    let err = resolve_json(r#"{ "download": { "timeout_secs": 1e300 } }"#).unwrap_err();
    assert_matches!(err, CutoutError::InvalidConfig(message) if message.contains("timeout_secs"));
}

#[test]
fn default_config_round_trips_through_resolution() {
    let spelled_out = ConfigLoader::resolve_config(ConfigLoader::default_config()).unwrap();
    let implicit = ConfigLoader::resolve_config(Config::default()).unwrap();
    assert_eq!(spelled_out.catalog, implicit.catalog);
    assert_eq!(spelled_out.cuts, implicit.cuts);
    assert_eq!(spelled_out.cutout, implicit.cutout);
    assert_eq!(spelled_out.download, implicit.download);
    assert_eq!(spelled_out.archive, implicit.archive);
}
