//! Recursive, best-effort directory import.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use {
    futures::{
        FutureExt,
        future::{BoxFuture, join_all},
    },
    switchyard_config::env_subst::substitute_env,
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    catalog::{HandlerSink, PluginCatalog},
    error::PluginError,
    manifest::{PluginManifest, is_manifest},
};

/// Outcome of a completed [`import`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Handlers successfully registered.
    pub loaded: usize,
    /// One human-readable line per file that could not be registered, in
    /// completion order.
    pub failures: Vec<String>,
}

impl ImportReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Scan `dir` recursively and register a handler for every valid manifest.
///
/// Entries at the same level are processed concurrently. A bad manifest or an
/// unreadable subdirectory is recorded in the report and the scan carries on;
/// only an unreadable `dir` itself is an error.
pub async fn import<H, S>(
    dir: impl AsRef<Path>,
    catalog: &PluginCatalog<H>,
    sink: &S,
) -> Result<ImportReport, PluginError>
where
    H: Send + 'static,
    S: HandlerSink<H> + ?Sized,
{
    let dir = dir.as_ref();
    let entries = read_entries(dir)
        .await
        .map_err(|source| PluginError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;

    info!(dir = %dir.display(), "importing plugins");
    let scan = Scan {
        catalog,
        sink,
        loaded: AtomicUsize::new(0),
        failures: Mutex::new(Vec::new()),
    };
    scan.entries(entries).await;

    let report = ImportReport {
        loaded: scan.loaded.load(Ordering::Relaxed),
        failures: scan.failures.into_inner(),
    };
    info!(
        dir = %dir.display(),
        loaded = report.loaded,
        failed = report.failures.len(),
        "plugin import finished"
    );
    Ok(report)
}

struct Scan<'a, H, S: ?Sized> {
    catalog: &'a PluginCatalog<H>,
    sink: &'a S,
    loaded: AtomicUsize,
    failures: Mutex<Vec<String>>,
}

impl<H, S> Scan<'_, H, S>
where
    H: Send + 'static,
    S: HandlerSink<H> + ?Sized,
{
    // Boxed to break the entries -> visit -> entries recursion.
    fn entries(&self, entries: Vec<PathBuf>) -> BoxFuture<'_, ()> {
        async move {
            join_all(entries.into_iter().map(|path| self.visit(path))).await;
        }
        .boxed()
    }

    async fn visit(&self, path: PathBuf) {
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to stat plugin entry");
                self.fail(format!("{} failed to import", display_name(&path)))
                    .await;
                return;
            },
        };

        if meta.is_dir() {
            info!(dir = %path.display(), "importing folder");
            match read_entries(&path).await {
                Ok(entries) => self.entries(entries).await,
                Err(e) => {
                    warn!(dir = %path.display(), error = %e, "failed to read plugin folder");
                    self.fail(format!("{} failed to import", display_name(&path)))
                        .await;
                },
            }
            return;
        }

        if !is_manifest(&path) {
            debug!(path = %path.display(), "skipping non-manifest file");
            return;
        }

        let file = display_name(&path);
        match self.load(&path).await {
            Ok(()) => {
                self.loaded.fetch_add(1, Ordering::Relaxed);
                info!(file = %file, "loaded plugin");
            },
            Err(PluginError::NotAHandler { .. }) => {
                warn!(file = %file, "manifest does not name a handler");
                self.fail(format!("{file} is not a handler")).await;
            },
            Err(e) => {
                warn!(file = %file, error = %e, "failed to import plugin");
                self.fail(format!("{file} failed to import")).await;
            },
        }
    }

    async fn load(&self, path: &Path) -> Result<(), PluginError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| PluginError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let manifest = PluginManifest::parse(&substitute_env(&raw), path)?;
        let name = manifest
            .handler_name()
            .ok_or_else(|| PluginError::NotAHandler {
                path: path.to_path_buf(),
            })?;
        let handler = self.catalog.build(name, &manifest.params)?;
        self.sink
            .add_handler(handler)
            .await
            .map_err(PluginError::Register)
    }

    async fn fail(&self, message: String) {
        self.failures.lock().await.push(message);
    }
}

async fn read_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        entries.push(entry.path());
    }
    Ok(entries)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
