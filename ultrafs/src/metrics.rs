use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::access::AccessStrategy;
use crate::cache::CacheStats;
use crate::scheduler::SchedulerStats;

/// Every operation the engine exposes, used to break metrics down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    ReadMultiple,
    Write,
    Edit,
    Move,
    Copy,
    Delete,
    ListDirectory,
    CreateDirectory,
    Search,
    Compare,
    AnalyzeFile,
    AnalyzeProject,
    FindDuplicates,
    ChunkedWrite,
    SplitFile,
    JoinFiles,
    Batch,
}

impl OperationKind {
    pub const ALL: [OperationKind; 18] = [
        OperationKind::Read,
        OperationKind::ReadMultiple,
        OperationKind::Write,
        OperationKind::Edit,
        OperationKind::Move,
        OperationKind::Copy,
        OperationKind::Delete,
        OperationKind::ListDirectory,
        OperationKind::CreateDirectory,
        OperationKind::Search,
        OperationKind::Compare,
        OperationKind::AnalyzeFile,
        OperationKind::AnalyzeProject,
        OperationKind::FindDuplicates,
        OperationKind::ChunkedWrite,
        OperationKind::SplitFile,
        OperationKind::JoinFiles,
        OperationKind::Batch,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::ReadMultiple => "read_multiple",
            OperationKind::Write => "write",
            OperationKind::Edit => "edit",
            OperationKind::Move => "move",
            OperationKind::Copy => "copy",
            OperationKind::Delete => "delete",
            OperationKind::ListDirectory => "list_directory",
            OperationKind::CreateDirectory => "create_directory",
            OperationKind::Search => "search",
            OperationKind::Compare => "compare",
            OperationKind::AnalyzeFile => "analyze_file",
            OperationKind::AnalyzeProject => "analyze_project",
            OperationKind::FindDuplicates => "find_duplicates",
            OperationKind::ChunkedWrite => "chunked_write",
            OperationKind::SplitFile => "split_file",
            OperationKind::JoinFiles => "join_files",
            OperationKind::Batch => "batch",
        }
    }
}

#[derive(Debug, Default)]
struct OperationCounters {
    count: AtomicU64,
    errors: AtomicU64,
    total_micros: AtomicU64,
}

/// Tracks I/O volume and per-operation timings.
///
/// Cloning shares the counters, so the accessor, the mapped regions and the
/// engine all record into the same place.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    started: Instant,

    // Mapping metrics
    mmap_allocated: Arc<AtomicU64>,
    peak_mapped: Arc<AtomicU64>,

    // File processing metrics
    buffered_bytes: Arc<AtomicU64>,
    buffered_files_processed: Arc<AtomicU64>,
    mmap_files_processed: Arc<AtomicU64>,
    mapped_bytes: Arc<AtomicU64>,
    cache_hit_bytes: Arc<AtomicU64>,

    operations: Arc<[OperationCounters; 18]>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            mmap_allocated: Arc::new(AtomicU64::new(0)),
            peak_mapped: Arc::new(AtomicU64::new(0)),
            buffered_bytes: Arc::new(AtomicU64::new(0)),
            buffered_files_processed: Arc::new(AtomicU64::new(0)),
            mmap_files_processed: Arc::new(AtomicU64::new(0)),
            mapped_bytes: Arc::new(AtomicU64::new(0)),
            cache_hit_bytes: Arc::new(AtomicU64::new(0)),
            operations: Arc::new(Default::default()),
        }
    }

    /// Records bytes read into an owned buffer
    pub fn record_buffered_read(&self, bytes: u64) {
        self.buffered_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records memory mapped file
    pub fn record_mmap(&self, bytes: u64) {
        let total = self.mmap_allocated.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let mut peak = self.peak_mapped.load(Ordering::Relaxed);
        while total > peak {
            match self.peak_mapped.compare_exchange_weak(
                peak,
                total,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }
        debug!(
            "Memory mapped: {} bytes, total mapped: {} bytes",
            bytes, total
        );
    }

    /// Records unmapping of file
    pub fn record_munmap(&self, bytes: u64) {
        let total = self.mmap_allocated.fetch_sub(bytes, Ordering::Relaxed) - bytes;
        debug!(
            "Memory unmapped: {} bytes, total mapped: {} bytes",
            bytes, total
        );
    }

    /// Records which strategy served a file
    pub fn record_file_processing(&self, strategy: AccessStrategy, size: u64) {
        match strategy {
            AccessStrategy::Buffered => {
                self.buffered_files_processed.fetch_add(1, Ordering::Relaxed);
            }
            AccessStrategy::Mapped => {
                self.mmap_files_processed.fetch_add(1, Ordering::Relaxed);
                self.mapped_bytes.fetch_add(size, Ordering::Relaxed);
            }
        }
    }

    /// Records bytes served from the content cache without touching the file
    pub fn record_cache_hit(&self, bytes: u64) {
        self.cache_hit_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one completed operation
    pub fn record_operation(&self, kind: OperationKind, elapsed: Duration, ok: bool) {
        let counters = &self.operations[kind.index()];
        counters.count.fetch_add(1, Ordering::Relaxed);
        counters
            .total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if !ok {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Gets current I/O statistics
    pub fn get_stats(&self) -> IoStats {
        IoStats {
            mmap_allocated: self.mmap_allocated.load(Ordering::Relaxed),
            peak_mapped: self.peak_mapped.load(Ordering::Relaxed),
            buffered_bytes: self.buffered_bytes.load(Ordering::Relaxed),
            buffered_files: self.buffered_files_processed.load(Ordering::Relaxed),
            mmap_files: self.mmap_files_processed.load(Ordering::Relaxed),
            mapped_bytes: self.mapped_bytes.load(Ordering::Relaxed),
            cache_hit_bytes: self.cache_hit_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn operation_stats(&self, kind: OperationKind) -> OperationStats {
        let counters = &self.operations[kind.index()];
        let count = counters.count.load(Ordering::Relaxed);
        let total_micros = counters.total_micros.load(Ordering::Relaxed);
        OperationStats {
            count,
            errors: counters.errors.load(Ordering::Relaxed),
            average_ms: if count == 0 {
                0.0
            } else {
                total_micros as f64 / count as f64 / 1000.0
            },
        }
    }

    /// Builds the summary report from these counters plus cache and scheduler state
    pub fn report(&self, cache: CacheStats, scheduler: SchedulerStats) -> PerformanceReport {
        let uptime = self.started.elapsed();
        let io = self.get_stats();
        let mut per_operation = BTreeMap::new();
        let mut total_operations = 0;
        let mut failed_operations = 0;
        let mut total_micros = 0u64;

        for kind in OperationKind::ALL {
            let counters = &self.operations[kind.index()];
            let count = counters.count.load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            total_operations += count;
            failed_operations += counters.errors.load(Ordering::Relaxed);
            total_micros += counters.total_micros.load(Ordering::Relaxed);
            per_operation.insert(kind, self.operation_stats(kind));
        }

        let average_response_ms = if total_operations == 0 {
            0.0
        } else {
            total_micros as f64 / total_operations as f64 / 1000.0
        };
        let secs = uptime.as_secs_f64();
        let operations_per_second = if secs > 0.0 {
            total_operations as f64 / secs
        } else {
            0.0
        };

        PerformanceReport {
            uptime_secs: uptime.as_secs(),
            total_operations,
            failed_operations,
            average_response_ms,
            operations_per_second,
            memory_efficiency_percent: io.memory_efficiency_percent(),
            io,
            cache,
            scheduler,
            per_operation,
        }
    }

    /// Logs current I/O statistics
    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "I/O stats:\n\
             Memory mapped: {} bytes (peak {})\n\
             Buffered reads: {} bytes\n\
             Files served (buffered/mmap): {}/{}",
            stats.mmap_allocated,
            stats.peak_mapped,
            stats.buffered_bytes,
            stats.buffered_files,
            stats.mmap_files
        );
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about file access
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IoStats {
    pub mmap_allocated: u64,
    pub peak_mapped: u64,
    pub buffered_bytes: u64,
    pub buffered_files: u64,
    pub mmap_files: u64,
    /// Bytes served through mappings, cumulative
    pub mapped_bytes: u64,
    /// Bytes served from the content cache, cumulative
    pub cache_hit_bytes: u64,
}

impl IoStats {
    /// Share of served bytes that needed no fresh heap copy: cache hits plus
    /// mapped reads, over everything served. Zero before any read.
    pub fn memory_efficiency_percent(&self) -> f64 {
        let zero_copy = self.cache_hit_bytes + self.mapped_bytes;
        let served = zero_copy + self.buffered_bytes;
        if served == 0 {
            0.0
        } else {
            zero_copy as f64 / served as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct OperationStats {
    pub count: u64,
    pub errors: u64,
    pub average_ms: f64,
}

/// Performance summary produced on demand
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub uptime_secs: u64,
    pub total_operations: u64,
    pub failed_operations: u64,
    pub average_response_ms: f64,
    pub operations_per_second: f64,
    pub memory_efficiency_percent: f64,
    pub io: IoStats,
    pub cache: CacheStats,
    pub scheduler: SchedulerStats,
    pub per_operation: BTreeMap<OperationKind, OperationStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mmap_tracking() {
        let metrics = EngineMetrics::new();

        metrics.record_mmap(5000);
        metrics.record_mmap(3000);
        let stats = metrics.get_stats();
        assert_eq!(stats.mmap_allocated, 8000);
        assert_eq!(stats.peak_mapped, 8000);

        metrics.record_munmap(3000);
        let stats = metrics.get_stats();
        assert_eq!(stats.mmap_allocated, 5000);
        assert_eq!(stats.peak_mapped, 8000); // Peak should remain unchanged
    }

    #[test]
    fn test_file_processing_tracking() {
        let metrics = EngineMetrics::new();

        metrics.record_file_processing(AccessStrategy::Buffered, 1000);
        metrics.record_file_processing(AccessStrategy::Buffered, 100_000);
        metrics.record_file_processing(AccessStrategy::Mapped, 20_000_000);

        let stats = metrics.get_stats();
        assert_eq!(stats.buffered_files, 2);
        assert_eq!(stats.mmap_files, 1);
    }

    #[test]
    fn test_memory_efficiency_counts_bytes_not_lookups() {
        let metrics = EngineMetrics::new();
        assert_eq!(metrics.get_stats().memory_efficiency_percent(), 0.0);

        // One small buffered read, then one large mapped read
        metrics.record_buffered_read(1_000);
        metrics.record_file_processing(AccessStrategy::Buffered, 1_000);
        metrics.record_file_processing(AccessStrategy::Mapped, 3_000);
        let stats = metrics.get_stats();
        assert_eq!(stats.mapped_bytes, 3_000);
        assert!((stats.memory_efficiency_percent() - 75.0).abs() < 1e-9);

        metrics.record_cache_hit(4_000);
        let cache = CacheStats {
            hits: 1,
            misses: 9,
            hit_rate: 0.1,
            ..Default::default()
        };
        let report = metrics.report(cache, SchedulerStats::default());
        assert!((report.memory_efficiency_percent - 87.5).abs() < 1e-9);
        assert_eq!(report.io.cache_hit_bytes, 4_000);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = EngineMetrics::new();
        let clone = metrics.clone();
        clone.record_buffered_read(42);
        assert_eq!(metrics.get_stats().buffered_bytes, 42);
    }

    #[test]
    fn test_operation_breakdown() {
        let metrics = EngineMetrics::new();
        metrics.record_operation(OperationKind::Read, Duration::from_millis(2), true);
        metrics.record_operation(OperationKind::Read, Duration::from_millis(4), true);
        metrics.record_operation(OperationKind::Write, Duration::from_millis(6), false);

        let read = metrics.operation_stats(OperationKind::Read);
        assert_eq!(read.count, 2);
        assert_eq!(read.errors, 0);
        assert!((read.average_ms - 3.0).abs() < 1e-9);

        let report = metrics.report(CacheStats::default(), SchedulerStats::default());
        assert_eq!(report.total_operations, 3);
        assert_eq!(report.failed_operations, 1);
        assert!((report.average_response_ms - 4.0).abs() < 1e-9);
        assert_eq!(report.per_operation.len(), 2);
        assert!(!report.per_operation.contains_key(&OperationKind::Search));
    }

    #[test]
    fn test_report_serializes_kind_names() {
        let metrics = EngineMetrics::new();
        metrics.record_operation(OperationKind::ListDirectory, Duration::from_millis(1), true);
        let report = metrics.report(CacheStats::default(), SchedulerStats::default());
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["per_operation"]["list_directory"]["count"] == 1);
        assert_eq!(OperationKind::ListDirectory.name(), "list_directory");
    }
}
