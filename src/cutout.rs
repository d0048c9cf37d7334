use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::domain::{FetchRequest, ImageFormat};

pub const HIPS2FITS_URL: &str = "https://alasky.cds.unistra.fr/hips-image-services/hips2fits";
pub const SKYSERVER_CUTOUT_URL: &str =
    "https://skyserver.sdss.org/DR19/SkyserverWS/ImgCutout/getjpeg";
pub const SKYVIEW_URL: &str = "https://skyview.gsfc.nasa.gov/current/cgi/runquery.pl";
pub const DEFAULT_HIPS: &str = "CDS/P/SDSS9/color";
pub const DEFAULT_SKYVIEW_SURVEY: &str = "DSS";
/// Width and height of a SkyView cutout, degrees.
pub const DEFAULT_SKYVIEW_SIZE_DEG: f64 = 0.03;

/// Fraction of the object diameter added around it in every cutout.
pub const FOV_MARGIN: f64 = 0.25;

/// Gnomonic projection keeps distortion minimal over a few arcminutes.
const PROJECTION: &str = "TAN";

/// Field of view in degrees for an object of the given angular size
/// (arcseconds). Non-positive sizes are passed through unchecked.
pub fn field_of_view(angular_size_arcsec: f64) -> f64 {
    let size_deg = angular_size_arcsec / 3600.0;
    2.0 * size_deg * (1.0 + FOV_MARGIN)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "lowercase")]
pub enum CutoutService {
    Hips2Fits { hips: String },
    /// Fixed-scale JPEG cutouts; ignores the object's size.
    SkyServer { pixel_scale: f64 },
    /// Fixed-size FITS cutouts from a SkyView survey; ignores the object's size.
    SkyView { survey: String, size_deg: f64 },
}

impl Default for CutoutService {
    fn default() -> Self {
        CutoutService::Hips2Fits {
            hips: DEFAULT_HIPS.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CutoutBuilder {
    service: CutoutService,
    width: u32,
    height: u32,
    format: ImageFormat,
}

impl CutoutBuilder {
    pub fn new(service: CutoutService, width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            service,
            width,
            height,
            format,
        }
    }

    pub fn hips2fits(hips: &str) -> Self {
        Self::new(
            CutoutService::Hips2Fits {
                hips: hips.to_string(),
            },
            64,
            64,
            ImageFormat::Jpg,
        )
    }

    /// Format of the payloads the service is asked for.
    pub fn format(&self) -> ImageFormat {
        match self.service {
            CutoutService::Hips2Fits { .. } => self.format,
            CutoutService::SkyServer { .. } => ImageFormat::Jpg,
            CutoutService::SkyView { .. } => ImageFormat::Fits,
        }
    }

    pub fn url(&self, ra: f64, dec: f64, angular_size: f64) -> String {
        let (endpoint, params) = match &self.service {
            CutoutService::Hips2Fits { hips } => (
                HIPS2FITS_URL,
                vec![
                    ("hips", hips.clone()),
                    ("ra", ra.to_string()),
                    ("dec", dec.to_string()),
                    ("width", self.width.to_string()),
                    ("height", self.height.to_string()),
                    ("fov", field_of_view(angular_size).to_string()),
                    ("projection", PROJECTION.to_string()),
                    ("format", self.format.extension().to_string()),
                ],
            ),
            CutoutService::SkyServer { pixel_scale } => (
                SKYSERVER_CUTOUT_URL,
                vec![
                    ("ra", ra.to_string()),
                    ("dec", dec.to_string()),
                    ("scale", pixel_scale.to_string()),
                    ("width", self.width.to_string()),
                    ("height", self.height.to_string()),
                ],
            ),
            CutoutService::SkyView { survey, size_deg } => (
                SKYVIEW_URL,
                vec![
                    ("position", format!("{ra},{dec}")),
                    ("survey", survey.clone()),
                    ("pixels", self.pixels()),
                    ("size", size_deg.to_string()),
                ],
            ),
        };
        match Url::parse_with_params(endpoint, &params) {
            Ok(url) => url.to_string(),
            // not reachable with the constant endpoints
            Err(_) => {
                let query = params
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect::<Vec<_>>()
                    .join("&");
                format!("{endpoint}?{query}")
            }
        }
    }

    /// SkyView takes one number for square cutouts, `w,h` otherwise.
    fn pixels(&self) -> String {
        if self.width == self.height {
            self.width.to_string()
        } else {
            format!("{},{}", self.width, self.height)
        }
    }

    pub fn url_for(&self, request: &FetchRequest) -> String {
        self.url(request.ra, request.dec, request.angular_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_pairs(url: &str) -> Vec<(String, String)> {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn fov_adds_quarter_margin() {
        let fov = field_of_view(36.0);
        assert!((fov - 0.025).abs() < 1e-12);
    }

    #[test]
    fn hips2fits_url_has_exact_parameter_set() {
        let url = CutoutBuilder::hips2fits(DEFAULT_HIPS).url(120.5, -1.3, 5.0);
        assert!(url.starts_with(HIPS2FITS_URL));
        let pairs = query_pairs(&url);
        let keys = pairs.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec!["hips", "ra", "dec", "width", "height", "fov", "projection", "format"]
        );
        assert_eq!(pairs[0].1, "CDS/P/SDSS9/color");
        assert_eq!(pairs[6].1, "TAN");
        assert_eq!(pairs[7].1, "jpg");
        let fov: f64 = pairs[5].1.parse().unwrap();
        assert!((fov - 2.0 * (5.0 / 3600.0) * 1.25).abs() < 1e-15);
    }

    #[test]
    fn skyserver_url_uses_fixed_scale() {
        let builder = CutoutBuilder::new(
            CutoutService::SkyServer { pixel_scale: 0.4 },
            64,
            64,
            ImageFormat::Png,
        );
        let url = builder.url(10.0, 20.0, 5.0);
        assert!(url.starts_with(SKYSERVER_CUTOUT_URL));
        assert_eq!(builder.format(), ImageFormat::Jpg);
        let pairs = query_pairs(&url);
        assert!(pairs.contains(&("scale".to_string(), "0.4".to_string())));
        assert!(!pairs.iter().any(|(k, _)| k == "fov"));
    }

    #[test]
    fn skyview_url_requests_fixed_size_fits() {
        let builder = CutoutBuilder::new(
            CutoutService::SkyView {
                survey: DEFAULT_SKYVIEW_SURVEY.to_string(),
                size_deg: DEFAULT_SKYVIEW_SIZE_DEG,
            },
            500,
            500,
            ImageFormat::Jpg,
        );
        assert_eq!(builder.format(), ImageFormat::Fits);

        let url = builder.url(150.25, 2.5, 99.0);
        assert!(url.starts_with(SKYVIEW_URL));
        let pairs = query_pairs(&url);
        assert_eq!(
            pairs,
            vec![
                ("position".to_string(), "150.25,2.5".to_string()),
                ("survey".to_string(), "DSS".to_string()),
                ("pixels".to_string(), "500".to_string()),
                ("size".to_string(), "0.03".to_string()),
            ]
        );

        let wide = CutoutBuilder::new(
            CutoutService::SkyView {
                survey: "SDSSg".to_string(),
                size_deg: 0.1,
            },
            300,
            200,
            ImageFormat::Fits,
        );
        let pairs = query_pairs(&wide.url(1.0, -1.0, 5.0));
        assert!(pairs.contains(&("pixels".to_string(), "300,200".to_string())));
    }
}
