use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::access::FileAccessor;
use crate::cache::{CacheStats, ContentLoader, IntelligentCache};
use crate::config::{format_size, EngineConfig};
use crate::errors::{EngineError, EngineResult};
use crate::guard::PathGuard;
use crate::metrics::{EngineMetrics, OperationKind, PerformanceReport};
use crate::ops::analyze::{self, DuplicateGroup, FileAnalysis, ProjectAnalysis};
use crate::ops::batch::{self, BatchMode, Operation, OperationOutput};
use crate::ops::compare::{compare_bytes, Comparison};
use crate::ops::fs::{self as fs_ops, DirEntryInfo};
use crate::ops::{ItemOutcome, PayloadEncoding, ReadOutput};
use crate::scheduler::{CancellationToken, SchedulerStats, TaskHandle, TaskScheduler};
use crate::search::{self, PatternCache, SearchContext, SearchOptions, SearchStream};
use crate::write::chunked;
use crate::write::{EditOutcome, EditScope, SafeWriter, WriteOutcome};

/// The file-access engine.
///
/// Every operation takes caller-supplied paths, confines them with the
/// [`PathGuard`] before anything touches the disk, runs its work as a task
/// on the shared [`TaskScheduler`] and records its latency and outcome in
/// [`EngineMetrics`]. The engine is `Sync`; share it behind an `Arc` and call
/// it from as many threads as needed.
///
/// Multi-file operations fan out from the calling thread, keeping at most
/// `parallel_ops` of their own tasks outstanding, so a worker never waits on
/// another task.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    guard: PathGuard,
    cache: Arc<IntelligentCache>,
    accessor: Arc<FileAccessor>,
    loader: ContentLoader,
    writer: SafeWriter,
    scheduler: Arc<TaskScheduler>,
    metrics: EngineMetrics,
    patterns: Arc<PatternCache>,
    root_token: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let guard = PathGuard::new(&config.allowed_dirs)?;
        let metrics = EngineMetrics::new();

        let cache = Arc::new(IntelligentCache::new(config.cache_size, config.half_life()?));
        let accessor = Arc::new(FileAccessor::new(
            config.mmap_threshold,
            config.mmap_enabled,
            metrics.clone(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(config.parallel_ops, config.queue_bound)?);
        let loader = ContentLoader::new(Arc::clone(&cache), Arc::clone(&accessor));
        let writer = SafeWriter::new(
            Arc::clone(&cache),
            Arc::clone(&accessor),
            guard.roots(),
            config.backup_dir.clone(),
        );

        info!(
            "Engine started: {} allowed dir(s), cache {}, {} workers, queue bound {}, mmap {}",
            guard.roots().len(),
            format_size(config.cache_size),
            config.parallel_ops,
            config.queue_bound,
            if config.mmap_enabled {
                format!("from {}", format_size(config.mmap_threshold))
            } else {
                "disabled".to_string()
            }
        );

        Ok(Self {
            config,
            guard,
            cache,
            accessor,
            loader,
            writer,
            scheduler,
            metrics,
            patterns: Arc::new(PatternCache::default()),
            root_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// A fresh token that is also cancelled by [`shutdown`](Self::shutdown)
    pub fn token(&self) -> CancellationToken {
        self.root_token.child_token()
    }

    pub fn report(&self) -> PerformanceReport {
        self.metrics
            .report(self.cache.stats(), self.scheduler.stats())
    }

    /// Cancels outstanding work and refuses new operations
    pub fn shutdown(&self) {
        info!("Engine shutting down");
        self.root_token.cancel();
        self.scheduler.shutdown();
        self.metrics.log_stats();
    }

    pub fn is_shut_down(&self) -> bool {
        self.scheduler.is_shut_down()
    }

    /// Reads a whole file, from the cache when its identity still matches
    pub fn read(&self, path: impl AsRef<Path>) -> EngineResult<ReadOutput> {
        self.timed(OperationKind::Read, path.as_ref(), || {
            let resolved = self.guard.resolve(&path)?;
            let loader = self.loader.clone();
            let threshold = self.config.binary_threshold;
            self.run(OperationKind::Read, &self.root_token, move |_| {
                read_file(&loader, resolved, threshold)
            })
        })
    }

    /// Reads several files concurrently. Each item succeeds or fails on its
    /// own; outcomes come back in input order.
    pub fn read_multiple<P: AsRef<Path>>(&self, paths: &[P]) -> Vec<ItemOutcome<ReadOutput>> {
        let started = Instant::now();
        let threshold = self.config.binary_threshold;

        let jobs = paths
            .iter()
            .map(|p| {
                self.guard.resolve(p).map(|resolved| {
                    let loader = self.loader.clone();
                    move |_: &CancellationToken| read_file(&loader, resolved, threshold)
                })
            })
            .collect();
        let results = self.fan_out(OperationKind::Read, &self.root_token, jobs);

        let outcomes: Vec<ItemOutcome<ReadOutput>> = paths
            .iter()
            .zip(results)
            .map(|(p, result)| {
                ItemOutcome::new(p.as_ref(), result.map_err(|e| e.with_path(p)))
            })
            .collect();
        let ok = outcomes.iter().all(ItemOutcome::is_ok);
        self.metrics
            .record_operation(OperationKind::ReadMultiple, started.elapsed(), ok);
        outcomes
    }

    /// Atomically replaces (or creates) a file
    pub fn write_safe(
        &self,
        path: impl AsRef<Path>,
        content: &[u8],
        backup: bool,
    ) -> EngineResult<WriteOutcome> {
        self.timed(OperationKind::Write, path.as_ref(), || {
            let resolved = self.guard.resolve_for_create(&path)?;
            let writer = self.writer.clone();
            let content = content.to_vec();
            self.run(OperationKind::Write, &self.root_token, move |_| {
                writer.write_safe(&resolved, &content, backup)
            })
        })
    }

    /// Replaces literal occurrences of `find` in an existing file
    pub fn edit(
        &self,
        path: impl AsRef<Path>,
        find: &str,
        replace: &str,
        scope: EditScope,
        backup: bool,
    ) -> EngineResult<EditOutcome> {
        self.timed(OperationKind::Edit, path.as_ref(), || {
            let resolved = self.guard.resolve(&path)?;
            let writer = self.writer.clone();
            let find = find.to_string();
            let replace = replace.to_string();
            self.run(OperationKind::Edit, &self.root_token, move |_| {
                writer.edit(&resolved, &find, &replace, scope, backup)
            })
        })
    }

    pub fn move_path(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> EngineResult<PathBuf> {
        self.timed(OperationKind::Move, from.as_ref(), || {
            let source = self.resolve_not_root(from.as_ref())?;
            let dest = self.guard.resolve_for_create(&to)?;
            let cache = Arc::clone(&self.cache);
            let accessor = Arc::clone(&self.accessor);
            self.run(OperationKind::Move, &self.root_token, move |_| {
                let _source_pin = cache.pin(&source)?;
                let _dest_pin = cache.pin(&dest)?;
                let moved = fs_ops::move_path(&source, &dest)?;
                forget(&cache, &accessor, &source);
                forget(&cache, &accessor, &dest);
                Ok(moved)
            })
        })
    }

    pub fn copy_path(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> EngineResult<PathBuf> {
        self.timed(OperationKind::Copy, from.as_ref(), || {
            let source = self.guard.resolve(&from)?;
            let dest = self.guard.resolve_for_create(&to)?;
            let cache = Arc::clone(&self.cache);
            let accessor = Arc::clone(&self.accessor);
            self.run(OperationKind::Copy, &self.root_token, move |_| {
                let _dest_pin = cache.pin(&dest)?;
                let copied = fs_ops::copy_path(&source, &dest)?;
                forget(&cache, &accessor, &dest);
                Ok(copied)
            })
        })
    }

    /// Deletes a file or directory; allowed roots themselves are refused
    pub fn delete(&self, path: impl AsRef<Path>, recursive: bool) -> EngineResult<()> {
        self.timed(OperationKind::Delete, path.as_ref(), || {
            let target = self.resolve_not_root(path.as_ref())?;
            let cache = Arc::clone(&self.cache);
            let accessor = Arc::clone(&self.accessor);
            self.run(OperationKind::Delete, &self.root_token, move |_| {
                let _pin = cache.pin(&target)?;
                fs_ops::delete(&target, recursive)?;
                forget(&cache, &accessor, &target);
                Ok(())
            })
        })
    }

    pub fn list_directory(&self, path: impl AsRef<Path>) -> EngineResult<Vec<DirEntryInfo>> {
        self.timed(OperationKind::ListDirectory, path.as_ref(), || {
            let dir = self.guard.resolve(&path)?;
            self.run(OperationKind::ListDirectory, &self.root_token, move |_| {
                fs_ops::list_directory(&dir)
            })
        })
    }

    pub fn create_directory(&self, path: impl AsRef<Path>) -> EngineResult<PathBuf> {
        self.timed(OperationKind::CreateDirectory, path.as_ref(), || {
            let dir = self.guard.resolve_for_create(&path)?;
            self.run(OperationKind::CreateDirectory, &self.root_token, move |_| {
                fs_ops::create_directory(&dir)
            })
        })
    }

    /// Starts a streaming search. Empty `roots` searches every allowed
    /// directory. Cancelling `token` (or the stream's own token) stops it.
    pub fn search<P: AsRef<Path>>(
        &self,
        roots: &[P],
        pattern: &str,
        options: &SearchOptions,
        token: &CancellationToken,
    ) -> EngineResult<SearchStream> {
        let started = Instant::now();
        let result = self.start_search(roots, pattern, options, token).map_err(|e| {
            let subject = roots.first().map_or(Path::new(""), |root| root.as_ref());
            e.with_path(subject)
        });
        // A started stream records itself when it finishes
        if let Err(e) = &result {
            debug!("search failed to start: {}", e);
            self.metrics
                .record_operation(OperationKind::Search, started.elapsed(), false);
        }
        result
    }

    fn start_search<P: AsRef<Path>>(
        &self,
        roots: &[P],
        pattern: &str,
        options: &SearchOptions,
        token: &CancellationToken,
    ) -> EngineResult<SearchStream> {
        if self.is_shut_down() {
            return Err(EngineError::Cancelled);
        }
        let resolved = if roots.is_empty() {
            self.guard.roots().to_vec()
        } else {
            roots
                .iter()
                .map(|root| self.guard.resolve(root))
                .collect::<EngineResult<Vec<_>>>()?
        };

        let ctx = SearchContext {
            scheduler: Arc::clone(&self.scheduler),
            loader: self.loader.clone(),
            metrics: self.metrics.clone(),
            patterns: Arc::clone(&self.patterns),
            chunk_size: self.config.search_chunk_size,
        };
        search::search(ctx, &resolved, pattern, options, token.child_token())
    }

    /// Line diff of two files
    pub fn compare(&self, a: impl AsRef<Path>, b: impl AsRef<Path>) -> EngineResult<Comparison> {
        self.timed(OperationKind::Compare, a.as_ref(), || {
            let a_label = a.as_ref().display().to_string();
            let b_label = b.as_ref().display().to_string();
            let a = self.guard.resolve(&a)?;
            let b = self.guard.resolve(&b)?;
            let loader = self.loader.clone();
            self.run(OperationKind::Compare, &self.root_token, move |token| {
                let left = loader.load(&a)?;
                token.check()?;
                let right = loader.load(&b)?;
                Ok(compare_bytes(&left.content, &right.content, &a_label, &b_label))
            })
        })
    }

    pub fn analyze_file(&self, path: impl AsRef<Path>) -> EngineResult<FileAnalysis> {
        self.timed(OperationKind::AnalyzeFile, path.as_ref(), || {
            let resolved = self.guard.resolve(&path)?;
            let loader = self.loader.clone();
            self.run(OperationKind::AnalyzeFile, &self.root_token, move |_| {
                let loaded = loader.load(&resolved)?;
                Ok(analyze::analyze_content(
                    &loaded.identity,
                    &loaded.content,
                    loaded.content.strategy(),
                ))
            })
        })
    }

    pub fn analyze_project(&self, root: impl AsRef<Path>) -> EngineResult<ProjectAnalysis> {
        self.timed(OperationKind::AnalyzeProject, root.as_ref(), || {
            let root = self.resolve_dir(root.as_ref())?;
            self.run(OperationKind::AnalyzeProject, &self.root_token, move |token| {
                analyze::analyze_project(&root, token)
            })
        })
    }

    /// Finds files with identical content under `root`. Files are bucketed by
    /// size first; only files sharing a size are hashed.
    pub fn find_duplicates(&self, root: impl AsRef<Path>) -> EngineResult<Vec<DuplicateGroup>> {
        self.timed(OperationKind::FindDuplicates, root.as_ref(), || {
            let root = self.resolve_dir(root.as_ref())?;
            let token = self.root_token.child_token();
            let walk_root = root.clone();
            let buckets = self.run(OperationKind::FindDuplicates, &token, move |token| {
                analyze::size_buckets(&walk_root, token)
            })?;
            debug!(
                "{} size bucket(s) with possible duplicates under {}",
                buckets.len(),
                root.display()
            );

            let mut groups = Vec::new();
            for (size, paths) in buckets {
                let jobs = paths
                    .iter()
                    .cloned()
                    .map(|path| Ok(move |_: &CancellationToken| analyze::hash_file(&path)))
                    .collect();
                let digests = self.fan_out(OperationKind::FindDuplicates, &token, jobs);

                let mut hashed = Vec::with_capacity(paths.len());
                for (path, digest) in paths.into_iter().zip(digests) {
                    match digest {
                        Ok(digest) => hashed.push((path, digest)),
                        Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                        Err(e) => warn!("Skipping {}: {}", path.display(), e),
                    }
                }
                groups.extend(analyze::group_digests(size, hashed));
            }
            Ok(groups)
        })
    }

    /// Writes `content` in `chunk_size` pieces, stopping between pieces when
    /// `token` is cancelled. The target changes only if every piece lands.
    pub fn chunked_write(
        &self,
        path: impl AsRef<Path>,
        content: &[u8],
        chunk_size: usize,
        token: &CancellationToken,
    ) -> EngineResult<WriteOutcome> {
        self.timed(OperationKind::ChunkedWrite, path.as_ref(), || {
            let resolved = self.guard.resolve_for_create(&path)?;
            let writer = self.writer.clone();
            let content = content.to_vec();
            self.run(OperationKind::ChunkedWrite, token, move |token| {
                chunked::chunked_write(&writer, &resolved, &content, chunk_size, token)
            })
        })
    }

    pub fn split_file(
        &self,
        path: impl AsRef<Path>,
        chunk_size: usize,
        out_dir: impl AsRef<Path>,
    ) -> EngineResult<Vec<PathBuf>> {
        self.timed(OperationKind::SplitFile, path.as_ref(), || {
            let source = self.guard.resolve(&path)?;
            let out_dir = self.guard.resolve_for_create(&out_dir)?;
            let writer = self.writer.clone();
            self.run(OperationKind::SplitFile, &self.root_token, move |token| {
                chunked::split_file(&writer, &source, chunk_size, &out_dir, token)
            })
        })
    }

    pub fn join_files<P: AsRef<Path>>(
        &self,
        parts: &[P],
        dest: impl AsRef<Path>,
    ) -> EngineResult<WriteOutcome> {
        self.timed(OperationKind::JoinFiles, dest.as_ref(), || {
            let parts = parts
                .iter()
                .map(|part| self.guard.resolve(part))
                .collect::<EngineResult<Vec<_>>>()?;
            let dest = self.guard.resolve_for_create(&dest)?;
            let writer = self.writer.clone();
            self.run(OperationKind::JoinFiles, &self.root_token, move |token| {
                chunked::join_files(&writer, &parts, &dest, token)
            })
        })
    }

    /// Runs `ops` in order; see [`BatchMode`] for failure handling
    pub fn batch(
        &self,
        ops: &[Operation],
        mode: BatchMode,
        token: &CancellationToken,
    ) -> Vec<ItemOutcome<OperationOutput>> {
        let started = Instant::now();
        let outcomes = batch::run(self, ops, mode, token);
        let ok = outcomes.iter().all(ItemOutcome::is_ok);
        self.metrics
            .record_operation(OperationKind::Batch, started.elapsed(), ok);
        outcomes
    }

    /// Times `op` and records its outcome under `kind`. Errors without a
    /// path of their own are tagged with `subject`.
    fn timed<T>(
        &self,
        kind: OperationKind,
        subject: &Path,
        op: impl FnOnce() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let started = Instant::now();
        let result = op().map_err(|e| e.with_path(subject));
        if let Err(e) = &result {
            debug!("{} failed: {}", kind.name(), e);
        }
        self.metrics
            .record_operation(kind, started.elapsed(), result.is_ok());
        result
    }

    /// Submits one task and waits for it
    fn run<T, F>(&self, kind: OperationKind, token: &CancellationToken, work: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> EngineResult<T> + Send + 'static,
    {
        self.scheduler.submit(kind, token, work)?.wait()
    }

    /// Submits `jobs` with at most `parallel_ops` outstanding and returns
    /// their results in input order. Jobs that are already errors pass
    /// through untouched.
    fn fan_out<T, F>(
        &self,
        kind: OperationKind,
        token: &CancellationToken,
        jobs: Vec<EngineResult<F>>,
    ) -> Vec<EngineResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> EngineResult<T> + Send + 'static,
    {
        let window_size = self.scheduler.parallel_ops();
        let mut results: Vec<Option<EngineResult<T>>> = (0..jobs.len()).map(|_| None).collect();
        let mut window: VecDeque<(usize, TaskHandle<T>)> = VecDeque::with_capacity(window_size);

        for (i, job) in jobs.into_iter().enumerate() {
            let work = match job {
                Ok(work) => work,
                Err(e) => {
                    results[i] = Some(Err(e));
                    continue;
                }
            };
            if window.len() >= window_size {
                if let Some((j, handle)) = window.pop_front() {
                    results[j] = Some(handle.wait());
                }
            }
            match self.scheduler.submit(kind, token, work) {
                Ok(handle) => window.push_back((i, handle)),
                Err(e) => results[i] = Some(Err(e)),
            }
        }
        for (j, handle) in window {
            results[j] = Some(handle.wait());
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(EngineError::Cancelled)))
            .collect()
    }

    fn resolve_not_root(&self, raw: &Path) -> EngineResult<PathBuf> {
        let resolved = self.guard.resolve(raw)?;
        if self.guard.is_root(&resolved) {
            warn!("Refusing to remove allowed directory {}", resolved.display());
            return Err(EngineError::access_denied(raw));
        }
        Ok(resolved)
    }

    fn resolve_dir(&self, raw: &Path) -> EngineResult<PathBuf> {
        let resolved = self.guard.resolve(raw)?;
        if !resolved.is_dir() {
            return Err(EngineError::invalid_argument(format!(
                "{} is not a directory",
                raw.display()
            )));
        }
        Ok(resolved)
    }
}

fn read_file(loader: &ContentLoader, path: PathBuf, binary_threshold: u64) -> EngineResult<ReadOutput> {
    let loaded = loader.load(&path)?;
    let size = loaded.content.len() as u64;
    Ok(ReadOutput {
        path,
        size,
        encoding: PayloadEncoding::for_len(size, binary_threshold),
        content: loaded.content,
        from_cache: loaded.from_cache,
    })
}

/// Drops cached content and mappings at or below `path`
fn forget(cache: &IntelligentCache, accessor: &FileAccessor, path: &Path) {
    cache.invalidate_prefix(path);
    accessor.invalidate_prefix(path);
}
