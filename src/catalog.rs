use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::domain::{Band, CatalogRow, FetchRequest, ObjectId};
use crate::error::CutoutError;

pub const DEFAULT_TAP_URL: &str = "http://tap.roe.ac.uk/ssa";

/// Columns kept when a filtered catalog is exported, in output order.
/// Columns absent from the source table are skipped.
pub fn export_columns(id_column: &str) -> Vec<String> {
    let mut columns = vec![
        id_column.to_string(),
        "specobjid".to_string(),
        "objid".to_string(),
        "ra".to_string(),
        "dec".to_string(),
        "p_el_debiased".to_string(),
        "p_cs_debiased".to_string(),
        "spiral".to_string(),
        "elliptical".to_string(),
        "petroR50_r".to_string(),
        "petroR90_r".to_string(),
    ];
    columns.extend(Band::ALL.iter().map(|band| band.magnitude_column()));
    columns.extend(Band::ALL.iter().map(|band| format!("extinction_{}", band.suffix())));
    let mut seen = std::collections::HashSet::new();
    columns.retain(|column| seen.insert(column.clone()));
    columns
}

/// ZooSpec joined with DR7 photometry, as pulled through the ROE TAP service.
pub fn zoo_spec_query(top: usize) -> String {
    format!(
        "SELECT TOP {top}\n    z.*,\n    p.*\n\
         FROM BestDR9.ZooSpec AS z\n\
         JOIN BestDR7.PhotoObj AS p\n    ON p.objid = z.dr7objid"
    )
}

pub trait CatalogClient: Send + Sync {
    fn query(&self, adql: &str) -> Result<Table, CutoutError>;
}

#[derive(Clone)]
pub struct TapHttpClient {
    client: Client,
    base_url: String,
}

impl TapHttpClient {
    pub fn new(base_url: &str) -> Result<Self, CutoutError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("zoo-cutouts/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CutoutError::CatalogHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| CutoutError::CatalogHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn sync_url(&self) -> String {
        format!("{}/sync", self.base_url)
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, CutoutError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        tracing::warn!(status, attempt, "TAP service busy, retrying");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        tracing::warn!(error = %err, attempt, "TAP request failed, retrying");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(CutoutError::CatalogHttp(err.to_string()));
                }
            }
        }
    }
}

impl CatalogClient for TapHttpClient {
    fn query(&self, adql: &str) -> Result<Table, CutoutError> {
        let url = self.sync_url();
        let response = self.send_with_retries(|| {
            self.client.get(&url).query(&[
                ("REQUEST", "doQuery"),
                ("LANG", "ADQL"),
                ("FORMAT", "csv"),
                ("QUERY", adql),
            ])
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "TAP request failed".to_string());
            return Err(CutoutError::CatalogStatus { status, message });
        }
        let body = response
            .text()
            .map_err(|err| CutoutError::CatalogHttp(err.to_string()))?;
        Table::from_csv_str(&body)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Row-oriented catalog result with the cells kept as text until a column is
/// asked for as numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, CutoutError> {
        if let Some((index, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            return Err(CutoutError::CatalogParse(format!(
                "row {index} has {} cells, expected {}",
                row.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, CutoutError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let columns = reader
            .headers()
            .map_err(|err| CutoutError::CatalogParse(err.to_string()))?
            .iter()
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| CutoutError::CatalogParse(err.to_string()))?;
            rows.push(record.iter().map(|cell| cell.to_string()).collect());
        }
        Self::new(columns, rows)
    }

    pub fn from_csv_str(content: &str) -> Result<Self, CutoutError> {
        Self::from_csv_reader(content.as_bytes())
    }

    /// Reads plain or gzip-compressed CSV, told apart by the gzip magic bytes.
    pub fn read_csv(path: &Path) -> Result<Self, CutoutError> {
        let mut file = File::open(path)
            .map_err(|err| CutoutError::Filesystem(format!("open {}: {err}", path.display())))?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .map_err(|err| CutoutError::Filesystem(format!("read {}: {err}", path.display())))?;
        if content.starts_with(&[0x1F, 0x8B]) {
            Self::from_csv_reader(GzDecoder::new(content.as_slice()))
        } else {
            Self::from_csv_reader(content.as_slice())
        }
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), CutoutError> {
        let mut writer = csv::Writer::from_writer(writer);
        writer
            .write_record(&self.columns)
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        for row in &self.rows {
            writer
                .write_record(row)
                .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        }
        writer
            .flush()
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, CutoutError> {
        let mut buffer = Vec::new();
        self.write_csv(&mut buffer)?;
        Ok(buffer)
    }

    /// Gzip-compressed CSV, the format the filtered catalog is exported in.
    pub fn to_csv_gz_bytes(&self) -> Result<Vec<u8>, CutoutError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        self.write_csv(&mut encoder)?;
        encoder
            .finish()
            .map_err(|err| CutoutError::Filesystem(err.to_string()))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.column_index(column)?;
        self.rows.get(row).map(|cells| cells[index].as_str())
    }

    /// A column counts as numeric only when every cell parses; a single bad
    /// cell leaves the whole column textual.
    pub fn is_numeric(&self, name: &str) -> bool {
        self.numeric_column(name).is_ok()
    }

    pub fn numeric_column(&self, name: &str) -> Result<Vec<f64>, CutoutError> {
        let index = self
            .column_index(name)
            .ok_or_else(|| CutoutError::MissingColumn(name.to_string()))?;
        self.rows
            .iter()
            .enumerate()
            .map(|(row, cells)| {
                parse_numeric(&cells[index]).ok_or_else(|| CutoutError::NonNumericColumn {
                    column: name.to_string(),
                    row,
                    value: cells[index].clone(),
                })
            })
            .collect()
    }

    pub fn text_column(&self, name: &str) -> Result<Vec<&str>, CutoutError> {
        let index = self
            .column_index(name)
            .ok_or_else(|| CutoutError::MissingColumn(name.to_string()))?;
        Ok(self.rows.iter().map(|cells| cells[index].as_str()).collect())
    }

    /// Converts every row into a [`CatalogRow`]. Any missing or non-numeric
    /// required column aborts the conversion.
    pub fn catalog_rows(&self, id_column: &str) -> Result<Vec<CatalogRow>, CutoutError> {
        let ids = self
            .text_column(id_column)?
            .into_iter()
            .map(|value| value.parse::<ObjectId>())
            .collect::<Result<Vec<_>, _>>()?;
        let ra = self.numeric_column("ra")?;
        let dec = self.numeric_column("dec")?;
        let petro = self.numeric_column("petroR90_r")?;
        let p_el = self.numeric_column("p_el_debiased")?;
        let p_cs = self.numeric_column("p_cs_debiased")?;
        let mut magnitudes = Vec::with_capacity(Band::ALL.len());
        let mut errors = Vec::with_capacity(Band::ALL.len());
        for band in Band::ALL {
            magnitudes.push(self.numeric_column(&band.magnitude_column())?);
            errors.push(self.numeric_column(&band.error_column())?);
        }

        Ok(ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| CatalogRow {
                id,
                ra: ra[i],
                dec: dec[i],
                magnitudes: std::array::from_fn(|band| magnitudes[band][i]),
                magnitude_errors: std::array::from_fn(|band| errors[band][i]),
                petro_r90_r: petro[i],
                p_el_debiased: p_el[i],
                p_cs_debiased: p_cs[i],
            })
            .collect())
    }

    /// Cutout requests from the id, position and size columns only, so an
    /// exported table without the photometry still drives a download.
    pub fn fetch_requests(&self, id_column: &str) -> Result<Vec<FetchRequest>, CutoutError> {
        let ids = self.text_column(id_column)?;
        let ra = self.numeric_column("ra")?;
        let dec = self.numeric_column("dec")?;
        let size = self.numeric_column("petroR90_r")?;
        ids.into_iter()
            .enumerate()
            .map(|(i, id)| {
                Ok(FetchRequest {
                    id: id.parse()?,
                    ra: ra[i],
                    dec: dec[i],
                    angular_size: size[i],
                })
            })
            .collect()
    }

    /// Keeps the rows whose mask entry is true, preserving input order.
    pub fn retain_mask(&self, mask: &[bool]) -> Table {
        let rows = self
            .rows
            .iter()
            .zip(mask.iter().copied().chain(std::iter::repeat(false)))
            .filter(|(_, keep)| *keep)
            .map(|(row, _)| row.clone())
            .collect();
        Table {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Projects onto the listed columns that exist, in the listed order.
    pub fn select_columns(&self, names: &[String]) -> Table {
        let indices = names
            .iter()
            .filter_map(|name| self.column_index(name))
            .collect::<Vec<_>>();
        Table {
            columns: indices.iter().map(|&i| self.columns[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        }
    }
}

fn parse_numeric(cell: &str) -> Option<f64> {
    let trimmed = cell.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") || trimmed == "--" {
        return Some(f64::NAN);
    }
    if trimmed.eq_ignore_ascii_case("true") {
        return Some(1.0);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Some(0.0);
    }
    trimmed.parse::<f64>().ok()
}
