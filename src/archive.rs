use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::ImageFormat;
use crate::error::CutoutError;
use crate::fetch::CutoutResult;

/// One image destined for the archive. The size recorded in the tar header
/// always comes from the payload itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    name: String,
    payload: Vec<u8>,
}

impl ArchiveEntry {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveCompression {
    #[default]
    None,
    Gzip,
}

impl ArchiveCompression {
    pub fn file_extension(self) -> &'static str {
        match self {
            ArchiveCompression::None => "tar",
            ArchiveCompression::Gzip => "tar.gz",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub path: String,
    pub entries: usize,
    pub bytes: u64,
    pub names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    path: PathBuf,
    compression: ArchiveCompression,
    extension: ImageFormat,
}

impl ArchiveWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            compression: ArchiveCompression::None,
            extension: ImageFormat::Jpg,
        }
    }

    pub fn compression(mut self, compression: ArchiveCompression) -> Self {
        self.compression = compression;
        self
    }

    /// Extension given to every member, `{name}.{ext}`.
    pub fn extension(mut self, format: ImageFormat) -> Self {
        self.extension = format;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the entries in the order given into a temp file next to the
    /// destination, syncs it and then persists it over any existing file.
    /// On error the temp file is removed and a previous archive is untouched.
    pub fn write<I>(&self, entries: I) -> Result<ArchiveReport, CutoutError>
    where
        I: IntoIterator<Item = ArchiveEntry>,
    {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp = tempfile::Builder::new()
            .prefix(".zoo-cutouts-archive")
            .tempfile_in(parent)
            .map_err(|err| {
                CutoutError::Archive(format!("create {}: {err}", self.path.display()))
            })?;

        let file = temp.as_file();
        let (names, bytes) = match self.compression {
            ArchiveCompression::None => {
                let mut builder = tar::Builder::new(file);
                let written = append_entries(&mut builder, entries, self.extension)?;
                let file = builder.into_inner().map_err(archive_err)?;
                file.sync_all().map_err(archive_err)?;
                written
            }
            ArchiveCompression::Gzip => {
                let encoder = GzEncoder::new(file, Compression::default());
                let mut builder = tar::Builder::new(encoder);
                let written = append_entries(&mut builder, entries, self.extension)?;
                let encoder = builder.into_inner().map_err(archive_err)?;
                let file = encoder.finish().map_err(archive_err)?;
                file.sync_all().map_err(archive_err)?;
                written
            }
        };
        temp.persist(&self.path).map_err(|err| {
            CutoutError::Archive(format!("persist {}: {}", self.path.display(), err.error))
        })?;

        info!(
            path = %self.path.display(),
            entries = names.len(),
            bytes,
            "archive written"
        );
        Ok(ArchiveReport {
            path: self.path.display().to_string(),
            entries: names.len(),
            bytes,
            names,
        })
    }
}

fn append_entries<W, I>(
    builder: &mut tar::Builder<W>,
    entries: I,
    extension: ImageFormat,
) -> Result<(Vec<String>, u64), CutoutError>
where
    W: Write,
    I: IntoIterator<Item = ArchiveEntry>,
{
    let mtime = chrono::Utc::now().timestamp().max(0) as u64;
    let mut names = Vec::new();
    let mut bytes = 0u64;
    for entry in entries {
        let name = format!("{}.{}", entry.name(), extension.extension());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(entry.size());
        header.set_mode(0o644);
        header.set_mtime(mtime);
        builder
            .append_data(&mut header, &name, entry.payload())
            .map_err(|err| CutoutError::Archive(format!("append {name}: {err}")))?;
        bytes += entry.size();
        names.push(name);
    }
    Ok((names, bytes))
}

fn archive_err(err: std::io::Error) -> CutoutError {
    CutoutError::Archive(err.to_string())
}

/// Successful cutouts as archive entries, in the order given. Payloads whose
/// magic bytes disagree with the requested format are kept but logged.
pub fn entries_from_results(
    results: Vec<CutoutResult>,
    expected: ImageFormat,
) -> Vec<ArchiveEntry> {
    results
        .into_iter()
        .filter_map(|result| {
            let payload = result.outcome.ok()?;
            match ImageFormat::sniff(&payload) {
                Some(actual) if actual != expected => {
                    warn!(
                        id = %result.id,
                        %expected,
                        %actual,
                        "cutout format differs from request"
                    );
                }
                None => warn!(id = %result.id, %expected, "cutout payload has unknown format"),
                _ => {}
            }
            Some(ArchiveEntry::new(result.id.as_str(), payload))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedMember {
    pub name: String,
    pub size: u64,
    pub payload: Vec<u8>,
}

/// Reads every member back, transparently handling gzip-compressed archives.
pub fn read_archive(path: &Path) -> Result<Vec<ArchivedMember>, CutoutError> {
    let bytes = fs::read(path)
        .map_err(|err| CutoutError::Archive(format!("open {}: {err}", path.display())))?;
    let reader: Box<dyn Read> = if bytes.starts_with(&[0x1F, 0x8B]) {
        Box::new(GzDecoder::new(Cursor::new(bytes)))
    } else {
        Box::new(Cursor::new(bytes))
    };
    let mut archive = tar::Archive::new(reader);
    let mut members = Vec::new();
    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let name = entry
            .path()
            .map_err(archive_err)?
            .to_string_lossy()
            .into_owned();
        let size = entry.header().size().map_err(archive_err)?;
        let mut payload = Vec::new();
        entry.read_to_end(&mut payload).map_err(archive_err)?;
        members.push(ArchivedMember {
            name,
            size,
            payload,
        });
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn gzip_archive_reads_back() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("images.tar.gz");
        let report = ArchiveWriter::new(&path)
            .compression(ArchiveCompression::Gzip)
            .write(vec![ArchiveEntry::new("7", b"abc".to_vec())])
            .unwrap();
        assert_eq!(report.names, vec!["7.jpg".to_string()]);

        let members = read_archive(&path).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].payload, b"abc".to_vec());
    }

    #[test]
    fn failed_write_leaves_no_temp_file_and_keeps_old_archive() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("images.tar");
        ArchiveWriter::new(&path)
            .write(vec![ArchiveEntry::new("1", b"old".to_vec())])
            .unwrap();

        // a parent-directory component is rejected by the tar builder
        let err = ArchiveWriter::new(&path)
            .write(vec![
                ArchiveEntry::new("2", b"new".to_vec()),
                ArchiveEntry::new("../escape", b"bad".to_vec()),
            ])
            .unwrap_err();
        assert_matches!(err, CutoutError::Archive(_));

        let files = fs::read_dir(temp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(files, vec!["images.tar".to_string()]);
        let members = read_archive(&path).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].payload, b"old".to_vec());
    }

    #[test]
    fn unwritable_path_is_an_archive_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("missing-dir").join("images.tar");
        let err = ArchiveWriter::new(&path).write(Vec::new()).unwrap_err();
        assert_matches!(err, CutoutError::Archive(_));
    }
}
