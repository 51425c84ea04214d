pub mod access;
pub mod cache;
pub mod config;
pub mod engine;
pub mod errors;
pub mod filters;
pub mod guard;
pub mod metrics;
pub mod ops;
pub mod results;
pub mod scheduler;
pub mod search;
pub mod write;

pub use access::{AccessIntent, AccessStrategy, FileAccessor, FileContent, FileHandle};
pub use cache::{CacheStats, IntelligentCache};
pub use config::{ConfigOverrides, EngineConfig, LogLevel};
pub use engine::Engine;
pub use errors::{EngineError, EngineResult, ErrorKind};
pub use guard::PathGuard;
pub use metrics::{EngineMetrics, OperationKind, PerformanceReport};
pub use ops::{BatchMode, ItemOutcome, Operation, OperationOutput, PayloadEncoding, ReadOutput};
pub use results::{FileResult, Match, SearchSummary};
pub use scheduler::{CancellationToken, SchedulerStats, TaskScheduler};
pub use search::{SearchOptions, SearchStream};
pub use write::{EditOutcome, EditScope, WriteOutcome};
