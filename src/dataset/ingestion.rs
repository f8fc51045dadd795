//! Data ingestion: fetch the dataset archive and unpack it
//!
//! Sources may be `http(s)` URLs (Google Drive share links are rewritten to
//! the direct-download endpoint), `file://` URLs or plain local paths.
//! An existing non-empty archive at the destination is never re-fetched.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use tracing::{info, warn};

use crate::config::DataIngestionConfig;
use crate::utils::error::{PipelineError, Result};
use crate::utils::format_bytes;

/// Where an archive comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    Remote(String),
    Local(PathBuf),
}

impl ArchiveSource {
    pub fn parse(source: &str) -> Self {
        let source = source.trim();
        if let Some(path) = source.strip_prefix("file://") {
            return ArchiveSource::Local(PathBuf::from(path));
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            let url = google_drive_direct_url(source).unwrap_or_else(|| source.to_string());
            return ArchiveSource::Remote(url);
        }
        ArchiveSource::Local(PathBuf::from(source))
    }
}

/// Rewrite a Google Drive share link to its direct-download form
pub fn google_drive_direct_url(url: &str) -> Option<String> {
    if !url.contains("drive.google.com") {
        return None;
    }
    let id = if let Some(rest) = url.split("/file/d/").nth(1) {
        rest.split(['/', '?']).next()
    } else {
        url.split(['?', '&'])
            .find_map(|part| part.strip_prefix("id="))
    }?;
    if id.is_empty() {
        return None;
    }
    Some(format!(
        "https://drive.google.com/uc?export=download&id={}&confirm=t",
        id
    ))
}

/// Result of [`DataIngestion::fetch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded { bytes: u64 },
    AlreadyPresent { bytes: u64 },
}

/// Archive formats understood by [`DataIngestion::extract`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Sniff the format from the first bytes of the file
    pub fn detect(path: &Path) -> Result<Self> {
        let mut magic = [0u8; 4];
        let mut file = File::open(path).map_err(|e| {
            PipelineError::Archive(format!("cannot open {}: {}", path.display(), e))
        })?;
        let read = file.read(&mut magic)?;
        match &magic[..read] {
            [0x50, 0x4b, 0x03, 0x04] | [0x50, 0x4b, 0x05, 0x06] => Ok(ArchiveFormat::Zip),
            [0x1f, 0x8b, ..] => Ok(ArchiveFormat::TarGz),
            _ => Err(PipelineError::Archive(format!(
                "{} is not a zip or tar.gz archive",
                path.display()
            ))),
        }
    }
}

/// Data ingestion component
#[derive(Debug, Clone)]
pub struct DataIngestion {
    config: DataIngestionConfig,
}

impl DataIngestion {
    pub fn new(config: DataIngestionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DataIngestionConfig {
        &self.config
    }

    /// Download (or copy) the archive to `local_data_file` unless it already exists
    pub fn fetch(&self) -> Result<FetchOutcome> {
        let dest = &self.config.local_data_file;
        if let Ok(meta) = fs::metadata(dest) {
            if meta.is_file() && meta.len() > 0 {
                info!(
                    "Archive already present at {} ({}), skipping download",
                    dest.display(),
                    format_bytes(meta.len())
                );
                return Ok(FetchOutcome::AlreadyPresent { bytes: meta.len() });
            }
        }
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let partial = dest.with_extension("part");
        let written = match ArchiveSource::parse(&self.config.source_url) {
            ArchiveSource::Remote(url) => {
                info!("Downloading data from {} into {}", url, dest.display());
                download(&url, &partial)
            }
            ArchiveSource::Local(path) => {
                info!("Copying data from {} into {}", path.display(), dest.display());
                fs::copy(&path, &partial).map_err(|e| {
                    PipelineError::Network(format!("cannot read source {}: {}", path.display(), e))
                })
            }
        };

        let bytes = match written {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };
        fs::rename(&partial, dest)?;

        info!("Downloaded {} to {}", format_bytes(bytes), dest.display());
        Ok(FetchOutcome::Downloaded { bytes })
    }

    /// Unpack the archive into `unzip_dir`, overwriting existing files.
    ///
    /// Returns the number of regular files written.
    pub fn extract(&self) -> Result<usize> {
        let archive = &self.config.local_data_file;
        let target = &self.config.unzip_dir;
        if !archive.is_file() {
            return Err(PipelineError::Archive(format!(
                "archive not found: {}",
                archive.display()
            )));
        }
        fs::create_dir_all(target)?;

        let files = match ArchiveFormat::detect(archive)? {
            ArchiveFormat::Zip => extract_zip(archive, target)?,
            ArchiveFormat::TarGz => extract_tar_gz(archive, target)?,
        };

        info!("Extracted {} files into {}", files, target.display());
        Ok(files)
    }
}

fn download(url: &str, dest: &Path) -> Result<u64> {
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(None)
        .build()
        .map_err(|e| PipelineError::Network(format!("cannot build HTTP client: {}", e)))?;

    let mut response = client
        .get(url)
        .send()
        .map_err(|e| PipelineError::Network(format!("request to {} failed: {}", url, e)))?
        .error_for_status()
        .map_err(|e| PipelineError::Network(e.to_string()))?;

    let is_html = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/html"))
        .unwrap_or(false);
    if is_html {
        return Err(PipelineError::Network(format!(
            "{} returned an HTML page instead of an archive",
            url
        )));
    }

    let mut file = File::create(dest)?;
    response
        .copy_to(&mut file)
        .map_err(|e| PipelineError::Network(format!("download interrupted: {}", e)))
}

fn extract_zip(archive_path: &Path, target: &Path) -> Result<usize> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| PipelineError::Archive(format!("{}: {}", archive_path.display(), e)))?;

    let mut files = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| PipelineError::Archive(format!("entry {}: {}", i, e)))?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("Skipping unsafe archive entry: {}", entry.name());
            continue;
        };
        let out_path = target.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out).map_err(|e| {
            PipelineError::Archive(format!("corrupt entry {}: {}", out_path.display(), e))
        })?;
        files += 1;
    }
    Ok(files)
}

fn extract_tar_gz(archive_path: &Path, target: &Path) -> Result<usize> {
    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_overwrite(true);

    let corrupt = |e: io::Error| PipelineError::Archive(format!("{}: {}", archive_path.display(), e));

    let mut files = 0;
    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let is_file = entry.header().entry_type().is_file();
        if entry.unpack_in(target).map_err(corrupt)? && is_file {
            files += 1;
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn config(dir: &Path, source: String) -> DataIngestionConfig {
        DataIngestionConfig {
            root_dir: dir.join("data_ingestion"),
            source_url: source,
            local_data_file: dir.join("data_ingestion/data.zip"),
            unzip_dir: dir.join("data_ingestion"),
        }
    }

    #[test]
    fn test_drive_links_are_rewritten() {
        let url = "https://drive.google.com/file/d/1AbC_x-9/view?usp=sharing";
        assert_eq!(
            google_drive_direct_url(url).unwrap(),
            "https://drive.google.com/uc?export=download&id=1AbC_x-9&confirm=t"
        );
        assert_eq!(
            google_drive_direct_url("https://drive.google.com/open?id=XYZ").unwrap(),
            "https://drive.google.com/uc?export=download&id=XYZ&confirm=t"
        );
        assert!(google_drive_direct_url("https://example.com/data.zip").is_none());
    }

    #[test]
    fn test_source_parsing() {
        assert_eq!(
            ArchiveSource::parse("file:///tmp/a.zip"),
            ArchiveSource::Local(PathBuf::from("/tmp/a.zip"))
        );
        assert_eq!(
            ArchiveSource::parse("data/a.zip"),
            ArchiveSource::Local(PathBuf::from("data/a.zip"))
        );
        assert!(matches!(
            ArchiveSource::parse("https://example.com/a.zip"),
            ArchiveSource::Remote(_)
        ));
    }

    #[test]
    fn test_fetch_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.zip");
        write_zip(&source, &[("a.txt", b"hello")]);

        let ingestion = DataIngestion::new(config(dir.path(), format!("file://{}", source.display())));
        let first = ingestion.fetch().unwrap();
        assert!(matches!(first, FetchOutcome::Downloaded { .. }));
        let before = fs::read(&ingestion.config().local_data_file).unwrap();

        // A changed source must not be picked up once the archive exists
        write_zip(&source, &[("b.txt", b"changed")]);
        let second = ingestion.fetch().unwrap();
        assert!(matches!(second, FetchOutcome::AlreadyPresent { .. }));
        assert_eq!(fs::read(&ingestion.config().local_data_file).unwrap(), before);
    }

    #[test]
    fn test_missing_local_source_is_network_error() {
        let dir = TempDir::new().unwrap();
        let ingestion = DataIngestion::new(config(dir.path(), "/nonexistent/archive.zip".into()));
        let err = ingestion.fetch().unwrap_err();
        assert!(matches!(err, PipelineError::Network(_)));
        assert!(!ingestion.config().local_data_file.exists());
    }

    #[test]
    fn test_unreachable_host_is_network_error() {
        let dir = TempDir::new().unwrap();
        let ingestion = DataIngestion::new(config(dir.path(), "http://127.0.0.1:9/data.zip".into()));
        assert!(matches!(ingestion.fetch(), Err(PipelineError::Network(_))));
    }

    #[test]
    fn test_extract_zip_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), String::new());
        fs::create_dir_all(&cfg.root_dir).unwrap();
        write_zip(
            &cfg.local_data_file,
            &[
                ("Chest-CT-Scan-data/normal/1.png", b"n1"),
                ("Chest-CT-Scan-data/normal/2.png", b"n2"),
                ("Chest-CT-Scan-data/adenocarcinoma/1.png", b"a1"),
            ],
        );

        let ingestion = DataIngestion::new(cfg);
        assert_eq!(ingestion.extract().unwrap(), 3);
        assert_eq!(ingestion.extract().unwrap(), 3);
        let extracted = dir.path().join("data_ingestion/Chest-CT-Scan-data/normal/2.png");
        assert_eq!(fs::read(extracted).unwrap(), b"n2");
    }

    #[test]
    fn test_extract_skips_entries_escaping_target() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), String::new());
        fs::create_dir_all(&cfg.root_dir).unwrap();
        write_zip(&cfg.local_data_file, &[("../escape.txt", b"x"), ("ok.txt", b"y")]);

        let ingestion = DataIngestion::new(cfg);
        assert_eq!(ingestion.extract().unwrap(), 1);
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_extract_tar_gz() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path(), String::new());
        cfg.local_data_file = dir.path().join("data_ingestion/data.tar.gz");
        fs::create_dir_all(&cfg.root_dir).unwrap();

        let gz = flate2::write::GzEncoder::new(
            File::create(&cfg.local_data_file).unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(gz);
        for name in ["x/1.png", "x/2.png"] {
            let mut header = tar::Header::new_gnu();
            header.set_size(3);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, &b"abc"[..]).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        assert_eq!(DataIngestion::new(cfg).extract().unwrap(), 2);
        assert!(dir.path().join("data_ingestion/x/2.png").is_file());
    }

    #[test]
    fn test_corrupt_archive_is_archive_error() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), String::new());
        fs::create_dir_all(&cfg.root_dir).unwrap();
        fs::write(&cfg.local_data_file, b"this is not an archive").unwrap();

        let err = DataIngestion::new(cfg).extract().unwrap_err();
        assert!(matches!(err, PipelineError::Archive(_)));
    }

    #[test]
    fn test_truncated_zip_is_archive_error() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), String::new());
        fs::create_dir_all(&cfg.root_dir).unwrap();
        write_zip(&cfg.local_data_file, &[("a.txt", b"some content here")]);
        let bytes = fs::read(&cfg.local_data_file).unwrap();
        fs::write(&cfg.local_data_file, &bytes[..bytes.len() / 2]).unwrap();

        let err = DataIngestion::new(cfg).extract().unwrap_err();
        assert!(matches!(err, PipelineError::Archive(_)));
    }

    #[test]
    fn test_missing_archive_is_archive_error() {
        let dir = TempDir::new().unwrap();
        let err = DataIngestion::new(config(dir.path(), String::new())).extract().unwrap_err();
        assert!(matches!(err, PipelineError::Archive(_)));
    }
}
