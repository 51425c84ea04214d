use ignore::WalkBuilder;
use std::collections::VecDeque;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use super::matcher::PatternCache;
use super::processor::{chunk_ranges, ChunkResult, FileProcessor};
use super::SearchOptions;
use crate::access::FileContent;
use crate::cache::ContentLoader;
use crate::errors::{EngineError, EngineResult};
use crate::filters::{looks_binary, should_include_file, ExcludeSet};
use crate::metrics::{EngineMetrics, OperationKind};
use crate::results::Match;
use crate::scheduler::{CancellationToken, TaskHandle, TaskScheduler};

/// Shared engine pieces a search needs
#[derive(Debug, Clone)]
pub struct SearchContext {
    pub scheduler: Arc<TaskScheduler>,
    pub loader: ContentLoader,
    pub metrics: EngineMetrics,
    pub patterns: Arc<PatternCache>,
    /// Files at or above this size are scanned in parallel chunks
    pub chunk_size: u64,
}

#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    size: u64,
}

/// Which files under a root a search visits
#[derive(Debug)]
struct CandidateFilter {
    include_hidden: bool,
    file_types: Vec<String>,
    excludes: ExcludeSet,
}

impl CandidateFilter {
    fn walk(&self, root: &Path, token: &CancellationToken) -> EngineResult<Vec<Candidate>> {
        let mut candidates = Vec::new();
        let mut walker = WalkBuilder::new(root);
        walker
            .hidden(!self.include_hidden)
            .ignore(true)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .follow_links(false);

        for entry in walker.build() {
            token.check()?;
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };
            // Symlinks are not followed, so nothing outside the root is reached
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }

            let path = entry.path();
            let relative = match path.strip_prefix(root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => Path::new(path.file_name().unwrap_or(path.as_os_str())),
            };
            if !should_include_file(relative, &self.file_types, &self.excludes) {
                trace!("Filtered out {}", path.display());
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            candidates.push(Candidate {
                path: entry.into_path(),
                size,
            });
        }
        Ok(candidates)
    }
}

enum Job {
    /// Load and scan a whole file
    File { path: PathBuf },
    /// Load a large file and cut it into chunks
    Split { path: PathBuf },
    Chunk {
        path: PathBuf,
        content: FileContent,
        range: Range<usize>,
    },
}

enum TaskOutput {
    Scanned(ChunkResult),
    /// Chunk boundaries of a loaded file; empty for binary files
    Split {
        content: FileContent,
        ranges: Vec<Range<usize>>,
    },
}

struct Pending {
    path: PathBuf,
    starts_file: bool,
    splits: bool,
    handle: TaskHandle<TaskOutput>,
}

/// Starts a search over `roots` (already validated).
///
/// Fails up front on an invalid pattern or exclude glob; everything after
/// that is reported through the returned stream. `token` should be a token
/// dedicated to this search: the stream cancels it when it finishes or is
/// dropped. No file is touched until the stream is first polled.
pub fn search(
    ctx: SearchContext,
    roots: &[PathBuf],
    pattern: &str,
    options: &SearchOptions,
    token: CancellationToken,
) -> EngineResult<SearchStream> {
    info!("Starting search for {:?} in {} root(s)", pattern, roots.len());
    let started = Instant::now();

    let matcher = ctx
        .patterns
        .get_or_compile(pattern, options.regex, options.case_sensitive)?;
    let filter = CandidateFilter {
        include_hidden: options.include_hidden,
        file_types: options.file_types.clone(),
        excludes: ExcludeSet::new(&options.exclude_patterns)?,
    };

    let chunk_size = if matcher.may_span_lines() {
        debug!("Pattern may match across lines, scanning files whole");
        None
    } else {
        Some(ctx.chunk_size.max(1))
    };

    let window_size = ctx.scheduler.parallel_ops();
    Ok(SearchStream {
        scheduler: ctx.scheduler,
        loader: ctx.loader,
        processor: Arc::new(FileProcessor::new(matcher)),
        metrics: ctx.metrics,
        token,
        content_search: options.content_search,
        chunk_size,
        window_size,
        max_results: options.max_results,
        roots: roots.to_vec(),
        filter: Arc::new(filter),
        enumerated: false,
        candidates: VecDeque::new(),
        queued: VecDeque::new(),
        window: VecDeque::with_capacity(window_size),
        ready: VecDeque::new(),
        splitting: false,
        lines_before: 0,
        emitted: 0,
        files_scanned: 0,
        finished: false,
        started,
    })
}

/// Lazily produced, ordered search results.
///
/// Directory walks, file loads and scans all run as scheduler tasks. Each
/// call to `next` waits only for the oldest outstanding task. The stream
/// ends after `max_results` matches, when candidates run out, or after
/// yielding one `Cancelled` error once its token is cancelled. Dropping the
/// stream cancels whatever is still queued.
pub struct SearchStream {
    scheduler: Arc<TaskScheduler>,
    loader: ContentLoader,
    processor: Arc<FileProcessor>,
    metrics: EngineMetrics,
    token: CancellationToken,
    content_search: bool,
    /// `None` scans every file whole
    chunk_size: Option<u64>,
    window_size: usize,
    max_results: Option<usize>,

    roots: Vec<PathBuf>,
    filter: Arc<CandidateFilter>,
    enumerated: bool,
    candidates: VecDeque<Candidate>,
    queued: VecDeque<Job>,
    window: VecDeque<Pending>,
    ready: VecDeque<Match>,

    /// A split task is outstanding; its chunks must be queued before
    /// anything after it
    splitting: bool,
    lines_before: usize,
    emitted: usize,
    files_scanned: usize,
    finished: bool,
    started: Instant,
}

impl std::fmt::Debug for SearchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchStream").finish_non_exhaustive()
    }
}

impl SearchStream {
    /// The token that cancels this search
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Matches yielded so far
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Files whose contents have been scanned so far
    pub fn files_scanned(&self) -> usize {
        self.files_scanned
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    fn at_limit(&self) -> bool {
        self.max_results
            .is_some_and(|max| self.emitted + self.ready.len() >= max)
    }

    fn push_matches(&mut self, matches: impl IntoIterator<Item = Match>) {
        for m in matches {
            if self.at_limit() {
                break;
            }
            self.ready.push_back(m);
        }
        if self.at_limit() {
            debug!("Result limit reached, cancelling outstanding search tasks");
            self.stop_work();
        }
    }

    fn stop_work(&mut self) {
        self.token.cancel();
        self.window.clear();
        self.queued.clear();
        self.candidates.clear();
        self.splitting = false;
    }

    fn finish(&mut self, ok: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.stop_work();
        self.metrics
            .record_operation(OperationKind::Search, self.started.elapsed(), ok);
        info!(
            "Search complete. Found {} matches in {} scanned files",
            self.emitted, self.files_scanned
        );
    }

    /// Walks every root on the scheduler, then sorts the candidates by path
    fn enumerate(&mut self) -> EngineResult<()> {
        self.enumerated = true;
        let mut walks: VecDeque<TaskHandle<Vec<Candidate>>> = VecDeque::new();
        let mut found = Vec::new();

        for root in std::mem::take(&mut self.roots) {
            loop {
                let filter = Arc::clone(&self.filter);
                let walk_root = root.clone();
                let submitted =
                    self.scheduler
                        .submit(OperationKind::Search, &self.token, move |token| {
                            filter.walk(&walk_root, token)
                        });
                match submitted {
                    Ok(handle) => {
                        walks.push_back(handle);
                        break;
                    }
                    Err(EngineError::Overloaded { .. }) if !walks.is_empty() => {
                        if let Some(oldest) = walks.pop_front() {
                            found.extend(oldest.wait()?);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        for walk in walks {
            found.extend(walk.wait()?);
        }

        found.sort_by(|a, b| a.path.cmp(&b.path));
        found.dedup_by(|a, b| a.path == b.path);
        debug!("Found {} files to process", found.len());
        self.candidates = found.into();
        Ok(())
    }

    fn fill_window(&mut self) -> EngineResult<()> {
        if !self.content_search {
            // Name matching needs no I/O; do it inline until something turns up
            while self.ready.is_empty() {
                let Some(candidate) = self.candidates.pop_front() else {
                    break;
                };
                if let Some(m) = self.processor.match_file_name(&candidate.path) {
                    self.push_matches([m]);
                }
            }
            return Ok(());
        }

        while !self.splitting && self.window.len() < self.window_size {
            let job = match self.queued.pop_front() {
                Some(job) => job,
                None => match self.candidates.pop_front() {
                    Some(candidate) => self.plan(candidate),
                    None => break,
                },
            };

            if let Err((job, err)) = self.submit(job) {
                match err {
                    EngineError::Overloaded { .. } if !self.window.is_empty() => {
                        trace!("Scheduler full, draining before submitting more");
                        self.queued.push_front(job);
                        break;
                    }
                    err => return Err(err),
                }
            }
        }
        Ok(())
    }

    fn plan(&self, candidate: Candidate) -> Job {
        match self.chunk_size {
            Some(chunk_size) if candidate.size >= chunk_size => Job::Split {
                path: candidate.path,
            },
            _ => Job::File {
                path: candidate.path,
            },
        }
    }

    fn submit(&mut self, job: Job) -> Result<(), (Job, EngineError)> {
        let processor = Arc::clone(&self.processor);
        let (path, starts_file, splits, submitted) = match &job {
            Job::File { path } => {
                let loader = self.loader.clone();
                let task_path = path.clone();
                let submitted =
                    self.scheduler
                        .submit(OperationKind::Search, &self.token, move |token| {
                            token.check()?;
                            let loaded = loader.load(&task_path)?;
                            if looks_binary(&loaded.content) {
                                trace!("Skipping binary file {}", task_path.display());
                                return Ok(TaskOutput::Scanned(ChunkResult::default()));
                            }
                            Ok(TaskOutput::Scanned(processor.scan(&loaded.content, 0)))
                        });
                (path.clone(), true, false, submitted)
            }
            Job::Split { path } => {
                let loader = self.loader.clone();
                let task_path = path.clone();
                let chunk_size = self
                    .chunk_size
                    .and_then(|size| usize::try_from(size).ok())
                    .unwrap_or(usize::MAX);
                let submitted =
                    self.scheduler
                        .submit(OperationKind::Search, &self.token, move |token| {
                            token.check()?;
                            let loaded = loader.load(&task_path)?;
                            if looks_binary(&loaded.content) {
                                trace!("Skipping binary file {}", task_path.display());
                                return Ok(TaskOutput::Split {
                                    content: loaded.content,
                                    ranges: Vec::new(),
                                });
                            }
                            let ranges = chunk_ranges(&loaded.content, chunk_size);
                            trace!(
                                "Split {} into {} chunks of {} bytes",
                                task_path.display(),
                                ranges.len(),
                                chunk_size
                            );
                            Ok(TaskOutput::Split {
                                content: loaded.content,
                                ranges,
                            })
                        });
                (path.clone(), true, true, submitted)
            }
            Job::Chunk {
                path,
                content,
                range,
            } => {
                let content = content.clone();
                let range = range.clone();
                let submitted =
                    self.scheduler
                        .submit(OperationKind::Search, &self.token, move |token| {
                            token.check()?;
                            Ok(TaskOutput::Scanned(
                                processor.scan(&content[range.clone()], range.start as u64),
                            ))
                        });
                (path.clone(), false, false, submitted)
            }
        };

        match submitted {
            Ok(handle) => {
                self.splitting |= splits;
                self.window.push_back(Pending {
                    path,
                    starts_file,
                    splits,
                    handle,
                });
                Ok(())
            }
            Err(e) => Err((job, e)),
        }
    }

    fn accept(&mut self, path: PathBuf, starts_file: bool, output: TaskOutput) {
        if starts_file {
            self.lines_before = 0;
            self.files_scanned += 1;
        }
        match output {
            TaskOutput::Scanned(result) => {
                let lines_before = self.lines_before;
                self.lines_before += result.newlines;
                self.push_matches(
                    result
                        .matches
                        .into_iter()
                        .map(|m| m.into_match(&path, lines_before)),
                );
            }
            TaskOutput::Split { content, ranges } => {
                self.splitting = false;
                for range in ranges.into_iter().rev() {
                    self.queued.push_front(Job::Chunk {
                        path: path.clone(),
                        content: content.clone(),
                        range,
                    });
                }
            }
        }
    }
}

impl Iterator for SearchStream {
    type Item = EngineResult<Match>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(m) = self.ready.pop_front() {
                self.emitted += 1;
                return Some(Ok(m));
            }
            if self.finished {
                return None;
            }
            if self.at_limit() {
                self.finish(true);
                return None;
            }
            if self.token.is_cancelled() {
                self.finish(false);
                return Some(Err(EngineError::Cancelled));
            }

            if !self.enumerated {
                if let Err(e) = self.enumerate() {
                    self.finish(false);
                    return Some(Err(e));
                }
            }
            if let Err(e) = self.fill_window() {
                self.finish(false);
                return Some(Err(e));
            }
            if !self.ready.is_empty() {
                continue;
            }

            let Some(pending) = self.window.pop_front() else {
                self.finish(true);
                return None;
            };
            let Pending {
                path,
                starts_file,
                splits,
                handle,
            } = pending;
            match handle.wait() {
                Ok(output) => self.accept(path, starts_file, output),
                Err(EngineError::Cancelled) => {
                    self.finish(false);
                    return Some(Err(EngineError::Cancelled));
                }
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    if starts_file {
                        self.lines_before = 0;
                    }
                    if splits {
                        self.splitting = false;
                    }
                }
            }
        }
    }
}

impl Drop for SearchStream {
    fn drop(&mut self) {
        self.finish(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::FileAccessor;
    use crate::cache::IntelligentCache;
    use crate::errors::ErrorKind;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    fn context(parallel_ops: usize, queue_bound: usize, chunk_size: u64) -> SearchContext {
        let metrics = EngineMetrics::new();
        SearchContext {
            scheduler: Arc::new(TaskScheduler::new(parallel_ops, queue_bound).unwrap()),
            loader: ContentLoader::new(
                Arc::new(IntelligentCache::new(10 * 1024 * 1024, Duration::from_secs(300))),
                Arc::new(FileAccessor::new(64 * 1024, true, metrics.clone())),
            ),
            metrics,
            patterns: Arc::new(PatternCache::new(16)),
            chunk_size,
        }
    }

    fn hold_only_worker(ctx: &SearchContext) -> (Arc<AtomicBool>, TaskHandle<()>) {
        let release = Arc::new(AtomicBool::new(false));
        let blocker = {
            let release = Arc::clone(&release);
            ctx.scheduler
                .submit(OperationKind::Read, &CancellationToken::new(), move |_| {
                    while !release.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Ok(())
                })
                .unwrap()
        };
        (release, blocker)
    }

    fn run(
        ctx: SearchContext,
        root: &Path,
        pattern: &str,
        options: &SearchOptions,
    ) -> Vec<EngineResult<Match>> {
        search(
            ctx,
            &[root.to_path_buf()],
            pattern,
            options,
            CancellationToken::new(),
        )
        .unwrap()
        .collect()
    }

    #[test]
    fn test_search_with_metrics() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("test.txt"), "test line\ntest line 2\n").unwrap();

        let ctx = context(2, 16, 8 * 1024 * 1024);
        let metrics = ctx.metrics.clone();
        let results = run(ctx, dir.path(), "test", &SearchOptions::default());

        let matches: Vec<Match> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].line_number, 1);
        assert_eq!(matches[1].line_number, 2);
        assert_eq!(matches[1].byte_offset, 10);
        assert_eq!(metrics.operation_stats(OperationKind::Search).count, 1);
    }

    #[test]
    fn test_max_results_returns_first_in_path_order() {
        let dir = tempdir().unwrap();
        for i in 0..100 {
            fs::write(
                dir.path().join(format!("file_{:03}.txt", i)),
                format!("header\nneedle {}\n", i),
            )
            .unwrap();
        }

        let options = SearchOptions {
            max_results: Some(5),
            ..Default::default()
        };
        let matches: Vec<Match> = run(context(4, 8, 1 << 20), dir.path(), "needle", &options)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(matches.len(), 5);
        for (i, m) in matches.iter().enumerate() {
            assert!(m.path.ends_with(format!("file_{:03}.txt", i)));
            assert_eq!(m.line_number, 2);
            assert_eq!(m.line, format!("needle {}", i));
        }
    }

    #[test]
    fn test_large_file_is_chunked_with_correct_lines() {
        let dir = tempdir().unwrap();
        let mut content = String::new();
        for i in 0..3000 {
            content.push_str(&format!("line {} holds pattern_{}\n", i, i % 7));
        }
        fs::write(dir.path().join("big.log"), &content).unwrap();
        fs::write(dir.path().join("small.log"), "pattern_0 here\n").unwrap();

        let options = SearchOptions {
            regex: true,
            ..Default::default()
        };
        let matches: Vec<Match> = run(context(4, 64, 4096), dir.path(), r"pattern_\d", &options)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(matches.len(), 3001);
        let big: Vec<&Match> = matches.iter().filter(|m| m.path.ends_with("big.log")).collect();
        for (i, m) in big.iter().enumerate() {
            assert_eq!(m.line_number, i + 1);
            assert_eq!(m.line, format!("line {} holds pattern_{}", i, i % 7));
        }
        assert!(big.windows(2).all(|w| w[0].byte_offset < w[1].byte_offset));

        // Path order: big.log before small.log
        assert!(matches[3000].path.ends_with("small.log"));
    }

    #[test]
    fn test_file_name_search() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("report_q1.csv"), "no match inside").unwrap();
        fs::write(dir.path().join("nested/report_q2.csv"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "report").unwrap();

        let options = SearchOptions {
            content_search: false,
            ..Default::default()
        };
        let matches: Vec<Match> = run(context(2, 8, 1 << 20), dir.path(), "report", &options)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.line_number == 0));
        assert_eq!(matches[0].line, "report_q2.csv");
        assert_eq!(matches[1].line, "report_q1.csv");
    }

    #[test]
    fn test_filters_and_binary_skip() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("keep.rs"), "fn needle() {}\n").unwrap();
        fs::write(dir.path().join("skip.py"), "needle = 1\n").unwrap();
        fs::write(dir.path().join("blob.rs"), b"needle\0\x01\x02").unwrap();
        fs::create_dir(dir.path().join("generated")).unwrap();
        fs::write(dir.path().join("generated/out.rs"), "needle\n").unwrap();
        fs::write(dir.path().join(".hidden.rs"), "needle\n").unwrap();

        let options = SearchOptions {
            file_types: vec!["rs".to_string()],
            exclude_patterns: vec!["generated/**".to_string()],
            ..Default::default()
        };
        let matches: Vec<Match> = run(context(2, 8, 1 << 20), dir.path(), "needle", &options)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(matches.len(), 1);
        assert!(matches[0].path.ends_with("keep.rs"));
    }

    #[test]
    fn test_invalid_regex_fails_up_front() {
        let dir = tempdir().unwrap();
        let options = SearchOptions {
            regex: true,
            ..Default::default()
        };
        let err = search(
            context(1, 1, 1 << 20),
            &[dir.path().to_path_buf()],
            "([",
            &options,
            CancellationToken::new(),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_cancelled_search_ends_with_cancelled() {
        let dir = tempdir().unwrap();
        for i in 0..20 {
            fs::write(dir.path().join(format!("{i}.txt")), "needle\n").unwrap();
        }
        let token = CancellationToken::new();
        let mut stream = search(
            context(2, 8, 1 << 20),
            &[dir.path().to_path_buf()],
            "needle",
            &SearchOptions::default(),
            token.clone(),
        )
        .unwrap();

        assert!(stream.next().unwrap().is_ok());
        token.cancel();

        let rest: Vec<_> = stream.by_ref().collect();
        assert_eq!(rest.len(), 1);
        assert!(matches!(rest[0], Err(EngineError::Cancelled)));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_cancelled_search_submits_no_more_work() {
        let dir = tempdir().unwrap();
        for i in 0..50 {
            fs::write(dir.path().join(format!("{i:02}.txt")), "needle\n").unwrap();
        }
        let ctx = context(2, 4, 1 << 20);
        let scheduler = Arc::clone(&ctx.scheduler);
        let token = CancellationToken::new();
        let mut stream = search(
            ctx,
            &[dir.path().to_path_buf()],
            "needle",
            &SearchOptions::default(),
            token.clone(),
        )
        .unwrap();

        assert!(stream.next().unwrap().is_ok());
        token.cancel();
        let submitted = scheduler.stats().submitted;

        let rest: Vec<_> = stream.by_ref().collect();
        assert_eq!(rest.len(), 1);
        assert_eq!(scheduler.stats().submitted, submitted);
        assert!(stream.files_scanned() < 50);
    }

    #[test]
    fn test_overloaded_with_nothing_outstanding_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "needle\n").unwrap();

        let ctx = context(1, 0, 1 << 20);
        let (release, blocker) = hold_only_worker(&ctx);

        let results = run(ctx, dir.path(), "needle", &SearchOptions::default());
        release.store(true, Ordering::SeqCst);
        blocker.wait().unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap_err().kind(), ErrorKind::Overloaded);
    }

    #[test]
    fn test_overloaded_search_reads_nothing() {
        let dir = tempdir().unwrap();
        let body = "needle in a large file\n".repeat(300);
        assert!(body.len() > 6 * 1024);
        fs::write(dir.path().join("big.txt"), &body).unwrap();

        let ctx = context(1, 0, 1024);
        let loader = ctx.loader.clone();
        let metrics = ctx.metrics.clone();
        let (release, blocker) = hold_only_worker(&ctx);

        let results = run(ctx, dir.path(), "needle", &SearchOptions::default());
        release.store(true, Ordering::SeqCst);
        blocker.wait().unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap_err().kind(), ErrorKind::Overloaded);
        let cache = loader.cache().stats();
        assert_eq!(cache.count, 0);
        assert_eq!(cache.misses, 0);
        assert_eq!(metrics.get_stats().buffered_files, 0);
        assert_eq!(metrics.get_stats().mmap_files, 0);
    }

    #[test]
    fn test_multiline_match_across_chunk_boundary() {
        let dir = tempdir().unwrap();
        // Six 10-byte lines, then BEGIN; a 64-byte chunk ends right after "BEGIN\n"
        let mut content = "xxxxxxxxx\n".repeat(6);
        content.push_str("BEGIN\nEND\n");
        content.push_str(&"yyyyyyyyy\n".repeat(20));
        fs::write(dir.path().join("blocks.txt"), &content).unwrap();

        let bytes = content.as_bytes();
        assert_eq!(chunk_ranges(bytes, 64)[0], 0..66);

        let options = SearchOptions {
            regex: true,
            ..Default::default()
        };
        for chunk_size in [64, 1 << 20] {
            let matches: Vec<Match> =
                run(context(2, 8, chunk_size), dir.path(), r"BEGIN\nEND", &options)
                    .into_iter()
                    .map(|r| r.unwrap())
                    .collect();
            assert_eq!(matches.len(), 1, "chunk size {chunk_size}");
            assert_eq!(matches[0].line_number, 7);
            assert_eq!(matches[0].byte_offset, 60);
            assert_eq!(matches[0].matched_text(), "BEGIN");
        }
    }

    #[test]
    fn test_drop_cancels_token() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "needle\n").unwrap();
        let token = CancellationToken::new();
        let stream = search(
            context(1, 4, 1 << 20),
            &[dir.path().to_path_buf()],
            "needle",
            &SearchOptions::default(),
            token.clone(),
        )
        .unwrap();
        drop(stream);
        assert!(token.is_cancelled());
    }
}
