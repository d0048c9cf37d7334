use assert_matches::assert_matches;

use zoo_cutouts::domain::{Band, CatalogName, ImageFormat, Morphology, ObjectId};
use zoo_cutouts::error::CutoutError;

#[test]
fn object_ids_are_safe_archive_stems() {
    let id: ObjectId = "587722981742084144".parse().unwrap();
    assert_eq!(id.to_string(), "587722981742084144");

    for bad in ["", "a/b", "-1", "id with space"] {
        let err = bad.parse::<ObjectId>().unwrap_err();
        assert_matches!(err, CutoutError::InvalidObjectId(_));
    }
}

#[test]
fn catalog_names_reject_separators() {
    assert!("zoo-small.v2".parse::<CatalogName>().is_ok());
    let err = "zoo/small".parse::<CatalogName>().unwrap_err();
    assert_matches!(err, CutoutError::InvalidCatalogName(_));
}

#[test]
fn band_columns_follow_sdss_naming() {
    let columns = Band::ALL
        .iter()
        .map(|band| band.magnitude_column())
        .collect::<Vec<_>>();
    assert_eq!(
        columns,
        vec!["modelMag_u", "modelMag_g", "modelMag_r", "modelMag_i", "modelMag_z"]
    );
    assert_eq!(Band::G.error_column(), "modelMagErr_g");
}

#[test]
fn png_payloads_are_recognised() {
    let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
    assert_eq!(ImageFormat::sniff(&png), Some(ImageFormat::Png));
    assert_eq!(ImageFormat::Fits.to_string(), "fits");
}

#[test]
fn morphology_index_round_trips() {
    for label in Morphology::ALL {
        assert_eq!(Morphology::from_index(label.index()), label);
    }
    assert_eq!(Morphology::Spiral.to_string(), "Spiral");
}
