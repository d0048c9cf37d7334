use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::archive::{ArchiveReport, ArchiveWriter, entries_from_results};
use crate::catalog::{CatalogClient, Table, export_columns};
use crate::classifier::{ClassificationReport, FeatureSet, TrainOptions, train_and_evaluate};
use crate::config::{ConfigLoader, ResolvedConfig};
use crate::error::CutoutError;
use crate::fetch::{HttpTransport, RetryingFetcher, Sleeper, ThreadSleeper};
use crate::pool::{BatchSummary, fetch_all, sort_by_submission};
use crate::store::{Metadata, Store};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub force: bool,
    pub no_cache: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub run: RunOptions,
    /// Overrides `download.limit` from the config.
    pub limit: Option<usize>,
    /// Overrides `download.workers` from the config.
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub catalog: String,
    pub action: String,
    pub rows: Option<usize>,
    pub columns: Option<usize>,
    pub project_path: String,
    pub cache_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterResult {
    pub catalog: String,
    pub input_rows: usize,
    pub kept_rows: usize,
    pub rejected_rows: usize,
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub catalog: String,
    pub action: String,
    pub requested: usize,
    pub workers: usize,
    pub archive_path: String,
    pub summary: Option<BatchSummary>,
    pub archive: Option<ArchiveReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainResult {
    pub features_path: String,
    pub rows: usize,
    pub feature_columns: Vec<String>,
    pub trees: usize,
    pub report: ClassificationReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub entries: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub kind: String,
    pub name: String,
    pub rows: Option<usize>,
    pub source: Option<String>,
    pub created_at: Option<String>,
    pub project_path: Option<String>,
    pub cache_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub cleared: bool,
    pub cache_cleared: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitResult {
    pub path: String,
    pub written: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressSinkKind {
    Query,
    Filter,
    Download,
    Train,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn emit(sink: &dyn ProgressSink, message: impl Into<String>) {
    sink.event(ProgressEvent {
        message: message.into(),
        elapsed: None,
    });
}

pub struct App<C: CatalogClient, T: HttpTransport, S: Sleeper = ThreadSleeper> {
    store: Store,
    catalog: C,
    transport: T,
    sleeper: S,
}

impl<C: CatalogClient, T: HttpTransport> App<C, T, ThreadSleeper> {
    pub fn new(store: Store, catalog: C, transport: T) -> Self {
        Self::with_sleeper(store, catalog, transport, ThreadSleeper)
    }
}

impl<C: CatalogClient, T: HttpTransport, S: Sleeper> App<C, T, S> {
    pub fn with_sleeper(store: Store, catalog: C, transport: T, sleeper: S) -> Self {
        Self {
            store,
            catalog,
            transport,
            sleeper,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    /// Runs the catalog query, preferring a project copy, then the shared
    /// cache, before going to the TAP service.
    pub fn query(
        &self,
        config: &ResolvedConfig,
        options: RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<QueryResult, CutoutError> {
        let name = &config.catalog.name;
        emit(sink, format!("phase=Resolve; catalog {name}"));
        let project_path = self.store.project_raw_catalog_path(name);
        let cache_path = self.store.cache_raw_catalog_path(name);

        if !options.force && Store::exists(&project_path) {
            emit(sink, "phase=Store; already in project store");
            let table = Table::read_csv(project_path.as_std_path())?;
            return Ok(QueryResult {
                catalog: name.to_string(),
                action: "project".to_string(),
                rows: Some(table.len()),
                columns: Some(table.columns().len()),
                project_path: project_path.to_string(),
                cache_path: Store::exists(&cache_path).then(|| cache_path.to_string()),
            });
        }

        if !options.force && Store::exists(&cache_path) {
            emit(sink, "phase=Store; using cached catalog");
            let table = Table::read_csv(cache_path.as_std_path())?;
            if !options.dry_run {
                Store::copy_file_atomic(&cache_path, &project_path)?;
                let meta = Metadata::new("cache", "catalog", name.as_str(), &project_path)
                    .with_rows(table.len());
                Store::write_metadata(
                    &self.store.project_metadata_path("catalog", name.as_str()),
                    &meta,
                )?;
            }
            return Ok(QueryResult {
                catalog: name.to_string(),
                action: "cache".to_string(),
                rows: Some(table.len()),
                columns: Some(table.columns().len()),
                project_path: project_path.to_string(),
                cache_path: Some(cache_path.to_string()),
            });
        }

        if options.dry_run {
            return Ok(QueryResult {
                catalog: name.to_string(),
                action: "download".to_string(),
                rows: None,
                columns: None,
                project_path: project_path.to_string(),
                cache_path: (!options.no_cache).then(|| cache_path.to_string()),
            });
        }

        self.store.ensure_project_root()?;
        emit(sink, "phase=Query; tap.request");
        let start = Instant::now();
        let table = self.catalog.query(&config.catalog.query)?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Query; tap.response rows={} latency_ms={}",
                table.len(),
                start.elapsed().as_millis()
            ),
            elapsed: Some(start.elapsed()),
        });

        emit(sink, "phase=Store; writing catalog");
        Store::write_bytes_atomic(&project_path, &table.to_csv_bytes()?)?;
        let meta = Metadata::new(&config.catalog.tap_url, "catalog", name.as_str(), &project_path)
            .with_rows(table.len());
        Store::write_metadata(
            &self.store.project_metadata_path("catalog", name.as_str()),
            &meta,
        )?;
        if !options.no_cache {
            Store::copy_file_atomic(&project_path, &cache_path)?;
        }
        tracing::info!(catalog = %name, rows = table.len(), "catalog stored");

        Ok(QueryResult {
            catalog: name.to_string(),
            action: "download".to_string(),
            rows: Some(table.len()),
            columns: Some(table.columns().len()),
            project_path: project_path.to_string(),
            cache_path: (!options.no_cache).then(|| cache_path.to_string()),
        })
    }

    /// Applies the quality cuts to the stored raw catalog and exports the
    /// survivors as gzip CSV.
    pub fn filter(
        &self,
        config: &ResolvedConfig,
        options: RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<FilterResult, CutoutError> {
        let name = &config.catalog.name;
        let raw_path = self.store.project_raw_catalog_path(name);
        if !Store::exists(&raw_path) {
            return Err(CutoutError::CatalogNotFound(name.to_string()));
        }
        emit(sink, format!("phase=Filter; reading {raw_path}"));
        let table = Table::read_csv(raw_path.as_std_path())?;
        let rows = table.catalog_rows(&config.catalog.id_column)?;
        let mask = config.cuts.mask(&rows);
        let kept = table.retain_mask(&mask);
        let export = kept.select_columns(&export_columns(&config.catalog.id_column));
        emit(
            sink,
            format!("phase=Filter; kept {}/{} rows", kept.len(), table.len()),
        );
        tracing::info!(catalog = %name, input = table.len(), kept = kept.len(), "catalog filtered");

        let output_path = self.store.project_filtered_catalog_path(name);
        if !options.dry_run {
            emit(sink, "phase=Store; writing filtered catalog");
            Store::write_bytes_atomic(&output_path, &export.to_csv_gz_bytes()?)?;
            let meta = Metadata::new(raw_path.as_str(), "filtered", name.as_str(), &output_path)
                .with_rows(export.len());
            Store::write_metadata(
                &self.store.project_metadata_path("filtered", name.as_str()),
                &meta,
            )?;
        }

        Ok(FilterResult {
            catalog: name.to_string(),
            input_rows: table.len(),
            kept_rows: kept.len(),
            rejected_rows: table.len() - kept.len(),
            output_path: (!options.dry_run).then(|| output_path.to_string()),
        })
    }

    /// Fetches one cutout per filtered object and packs the successes into a
    /// tar archive. Failed objects are reported, never fatal.
    pub fn download(
        &self,
        config: &ResolvedConfig,
        options: DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, CutoutError> {
        let name = &config.catalog.name;
        let filtered_path = self.store.project_filtered_catalog_path(name);
        if !Store::exists(&filtered_path) {
            return Err(CutoutError::CatalogNotFound(format!("{name} (filtered)")));
        }
        let table = Table::read_csv(filtered_path.as_std_path())?;
        let mut requests = table.fetch_requests(&config.catalog.id_column)?;
        if let Some(limit) = options.limit.or(config.download.limit) {
            requests.truncate(limit);
        }
        let workers = options.workers.unwrap_or(config.download.workers).max(1);
        let archive_path = self.store.project_archive_path(&config.archive.file_name());
        emit(
            sink,
            format!("phase=Resolve; {} cutouts with {workers} workers", requests.len()),
        );

        if !options.run.force && Store::exists(&archive_path) {
            emit(sink, "phase=Store; archive already in project store");
            return Ok(DownloadResult {
                catalog: name.to_string(),
                action: "project".to_string(),
                requested: requests.len(),
                workers,
                archive_path: archive_path.to_string(),
                summary: None,
                archive: None,
            });
        }

        if options.run.dry_run {
            return Ok(DownloadResult {
                catalog: name.to_string(),
                action: "download".to_string(),
                requested: requests.len(),
                workers,
                archive_path: archive_path.to_string(),
                summary: None,
                archive: None,
            });
        }

        let builder = config.cutout.builder();
        let fetcher = RetryingFetcher::with_sleeper(
            &self.transport,
            &self.sleeper,
            config.download.policy,
        );
        let requested = requests.len();
        tracing::info!(
            requested,
            workers,
            worst_case_secs = config.download.policy.worst_case().as_secs(),
            "starting cutout downloads"
        );
        let start = Instant::now();
        let mut results = fetch_all(&fetcher, &builder, requests, workers, sink);
        sort_by_submission(&mut results);
        let summary = BatchSummary::from_results(&results);
        sink.event(ProgressEvent {
            message: format!(
                "phase=Fetch; finished ok={} failed={}",
                summary.succeeded, summary.failed
            ),
            elapsed: Some(start.elapsed()),
        });

        emit(sink, "phase=Archive; writing archive");
        Store::ensure_parent(&archive_path)?;
        let report = ArchiveWriter::new(archive_path.as_std_path())
            .compression(config.archive.compression)
            .extension(builder.format())
            .write(entries_from_results(results, builder.format()))?;

        let meta = Metadata::new(
            filtered_path.as_str(),
            "archive",
            config.archive.name.as_str(),
            &archive_path,
        )
        .with_rows(report.entries);
        Store::write_metadata(
            &self
                .store
                .project_metadata_path("archive", config.archive.name.as_str()),
            &meta,
        )?;

        Ok(DownloadResult {
            catalog: name.to_string(),
            action: "download".to_string(),
            requested,
            workers,
            archive_path: archive_path.to_string(),
            summary: Some(summary),
            archive: Some(report),
        })
    }

    pub fn train(
        &self,
        features_path: &Path,
        options: TrainOptions,
        sink: &dyn ProgressSink,
    ) -> Result<TrainResult, CutoutError> {
        emit(sink, format!("phase=Train; reading {}", features_path.display()));
        if !features_path.exists() {
            return Err(CutoutError::TrainingData(format!(
                "features file not found: {}",
                features_path.display()
            )));
        }
        let set = FeatureSet::read_csv(features_path)?;
        emit(
            sink,
            format!(
                "phase=Train; {} rows, {} features, {} trees",
                set.len(),
                set.feature_names.len(),
                options.forest.n_trees
            ),
        );
        let start = Instant::now();
        let model = train_and_evaluate(&set, &options)?;
        sink.event(ProgressEvent {
            message: format!("phase=Train; accuracy={:.3}", model.report.accuracy),
            elapsed: Some(start.elapsed()),
        });
        Ok(TrainResult {
            features_path: features_path.display().to_string(),
            rows: set.len(),
            feature_columns: model.feature_names,
            trees: model.forest.n_trees(),
            report: model.report,
        })
    }

    pub fn list(&self, sink: &dyn ProgressSink) -> Result<ListResult, CutoutError> {
        emit(sink, "phase=Resolve; scanning stores");

        let project_metadata = Store::list_metadata(self.store.project_root())?;
        let cache_metadata = Store::list_metadata(self.store.cache_root())?;

        let mut map = BTreeMap::<(String, String), ListEntry>::new();
        for (entry, in_project) in project_metadata
            .into_iter()
            .map(|entry| (entry, true))
            .chain(cache_metadata.into_iter().map(|entry| (entry, false)))
        {
            let value = map
                .entry((entry.kind.clone(), entry.name.clone()))
                .or_insert_with(|| ListEntry {
                    kind: entry.kind.clone(),
                    name: entry.name.clone(),
                    rows: entry.rows,
                    source: Some(entry.source.clone()),
                    created_at: Some(entry.created_at.clone()),
                    project_path: None,
                    cache_path: None,
                });
            if in_project {
                value.project_path = Some(entry.resolved_path);
            } else {
                value.cache_path = Some(entry.resolved_path);
            }
        }

        // the raw catalog cache carries no metadata of its own
        let catalogs = self.store.cache_root().join("catalogs");
        if let Ok(dirs) = fs::read_dir(catalogs.as_std_path()) {
            for dir in dirs.flatten() {
                let name = dir.file_name().to_string_lossy().into_owned();
                let raw = dir.path().join(crate::store::RAW_CATALOG_FILE);
                if !raw.is_file() {
                    continue;
                }
                let value = map
                    .entry(("catalog".to_string(), name.clone()))
                    .or_insert_with(|| ListEntry {
                        kind: "catalog".to_string(),
                        name,
                        rows: None,
                        source: None,
                        created_at: None,
                        project_path: None,
                        cache_path: None,
                    });
                value.cache_path = Some(raw.display().to_string());
            }
        }

        Ok(ListResult {
            entries: map.into_values().collect(),
        })
    }

    pub fn clear(&self, cache: bool, sink: &dyn ProgressSink) -> Result<ClearResult, CutoutError> {
        emit(sink, "phase=Store; clearing project store");
        self.store.clear_project()?;
        if cache {
            emit(sink, "phase=Store; clearing shared cache");
            self.store.clear_cache()?;
        }
        Ok(ClearResult {
            cleared: true,
            cache_cleared: cache,
        })
    }

    pub fn init_config(
        &self,
        path: &Path,
        force: bool,
        sink: &dyn ProgressSink,
    ) -> Result<InitResult, CutoutError> {
        emit(sink, format!("phase=Store; writing {}", path.display()));
        ConfigLoader::write_default(path, force)?;
        Ok(InitResult {
            path: path.display().to_string(),
            written: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::config::Config;
    use crate::error::FetchError;
    use crate::output::JsonOutput;

    struct FixedCatalog(Table);

    impl CatalogClient for FixedCatalog {
        fn query(&self, _adql: &str) -> Result<Table, CutoutError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct CountingTransport {
        calls: Mutex<usize>,
    }

    impl HttpTransport for CountingTransport {
        fn get(&self, _url: &str, _timeout: Duration) -> Result<Vec<u8>, FetchError> {
            *self.calls.lock().unwrap() += 1;
            Ok(vec![0xFF, 0xD8, 0xFF, 0xE0])
        }
    }

    fn temp_store(temp: &tempfile::TempDir) -> Store {
        let project_root = Utf8PathBuf::from_path_buf(temp.path().join("project")).unwrap();
        let cache_root = Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap();
        Store::new_with_paths(project_root, cache_root)
    }

    #[test]
    fn query_prefers_cache_over_download() {
        let temp = tempfile::tempdir().unwrap();
        let store = temp_store(&temp);
        let config = ConfigLoader::resolve_config(Config::default()).unwrap();
        let cache_path = store.cache_raw_catalog_path(&config.catalog.name);
        Store::write_bytes_atomic(&cache_path, b"dr7objid,ra\n1,2\n").unwrap();

        let app = App::new(
            store,
            FixedCatalog(Table::from_csv_str("dr7objid\n9\n").unwrap()),
            CountingTransport::default(),
        );
        let result = app.query(&config, RunOptions::default(), &JsonOutput).unwrap();
        assert_eq!(result.action, "cache");
        assert_eq!(result.rows, Some(1));
        assert!(Store::exists(&app.store().project_raw_catalog_path(&config.catalog.name)));
    }

    #[test]
    fn dry_run_download_fetches_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let store = temp_store(&temp);
        let config = ConfigLoader::resolve_config(Config::default()).unwrap();
        let filtered = store.project_filtered_catalog_path(&config.catalog.name);
        let table =
            Table::from_csv_str("dr7objid,ra,dec,petroR90_r\n1,10,0,5\n2,11,0,5\n").unwrap();
        Store::write_bytes_atomic(&filtered, &table.to_csv_gz_bytes().unwrap()).unwrap();

        let app = App::new(store, FixedCatalog(table), CountingTransport::default());
        let options = DownloadOptions {
            run: RunOptions {
                dry_run: true,
                ..RunOptions::default()
            },
            ..DownloadOptions::default()
        };
        let result = app.download(&config, options, &JsonOutput).unwrap();
        assert_eq!(result.requested, 2);
        assert!(result.summary.is_none());
        assert_eq!(*app.transport.calls.lock().unwrap(), 0);
    }
}
