use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use ultrafs::config::{format_size, parse_size};
use ultrafs::ops::{Comparison, DirEntryInfo, DuplicateGroup, EntryKind, FileAnalysis, ProjectAnalysis};
use ultrafs::{
    BatchMode, ConfigOverrides, EditScope, Engine, EngineConfig, EngineError, ItemOutcome,
    LogLevel, Operation, OperationOutput, PayloadEncoding, PerformanceReport, ReadOutput,
    SearchOptions, SearchSummary,
};

type Result<T> = std::result::Result<T, EngineError>;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Print the performance report to stderr when done
    #[arg(long, global = true)]
    stats: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct EngineArgs {
    /// Directory the engine may serve (repeatable; default: current directory)
    #[arg(short = 'a', long = "allowed-dir", global = true)]
    allowed_dirs: Vec<PathBuf>,

    /// Configuration file (YAML)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Content cache budget (e.g. 100MB)
    #[arg(long, global = true, value_parser = parse_size_arg)]
    cache_size: Option<u64>,

    /// Worker threads
    #[arg(short = 'j', long, global = true)]
    parallel_ops: Option<usize>,

    /// Tasks allowed to wait for a worker
    #[arg(long, global = true)]
    queue_bound: Option<usize>,

    /// Size at which read payloads are streamed rather than inlined
    #[arg(long, global = true, value_parser = parse_size_arg)]
    binary_threshold: Option<u64>,

    /// Size at which files are memory mapped
    #[arg(long, global = true, value_parser = parse_size_arg)]
    mmap_threshold: Option<u64>,

    /// Never memory map files
    #[arg(long, global = true)]
    no_mmap: bool,

    /// Directory for safe-write backups
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, value_parser = parse_log_level)]
    log_level: Option<LogLevel>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a file
    Read { path: PathBuf },

    /// Read several files at once
    ReadMultiple {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Atomically replace a file with the given content (stdin when omitted)
    Write {
        path: PathBuf,
        #[arg(long)]
        content: Option<String>,
        /// Keep a backup of the previous version
        #[arg(short, long)]
        backup: bool,
    },

    /// Replace text inside a file
    Edit {
        path: PathBuf,
        #[arg(short, long)]
        find: String,
        #[arg(short, long)]
        replace: String,
        /// Only the first occurrence
        #[arg(long, conflicts_with = "nth")]
        first: bool,
        /// Only the n-th occurrence (1-based)
        #[arg(long)]
        nth: Option<usize>,
        #[arg(short, long)]
        backup: bool,
    },

    /// Move or rename a file or directory
    Move { from: PathBuf, to: PathBuf },

    /// Copy a file or directory
    Copy { from: PathBuf, to: PathBuf },

    /// Delete a file or directory
    Delete {
        path: PathBuf,
        /// Delete non-empty directories
        #[arg(short, long)]
        recursive: bool,
    },

    /// List a directory
    List {
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Create a directory and its parents
    Mkdir { path: PathBuf },

    /// Search file contents (or names)
    Search(SearchArgs),

    /// Diff two files
    Compare { a: PathBuf, b: PathBuf },

    /// Size, line and word counts for a file
    Analyze { path: PathBuf },

    /// Summarize a directory tree
    AnalyzeProject {
        #[arg(default_value = ".")]
        root: PathBuf,
    },

    /// Find files with identical content
    Duplicates {
        #[arg(default_value = ".")]
        root: PathBuf,
    },

    /// Write stdin to a file in chunks
    ChunkedWrite {
        path: PathBuf,
        #[arg(long, value_parser = parse_size_arg, default_value = "1MB")]
        chunk_size: u64,
    },

    /// Split a file into numbered parts
    Split {
        path: PathBuf,
        #[arg(long, value_parser = parse_size_arg)]
        chunk_size: u64,
        #[arg(short, long)]
        out_dir: PathBuf,
    },

    /// Concatenate parts into one file
    Join {
        #[arg(required = true)]
        parts: Vec<PathBuf>,
        #[arg(short, long)]
        dest: PathBuf,
    },

    /// Run operations from a JSON file
    Batch {
        #[arg(short, long)]
        file: PathBuf,
        /// Validate everything first and stop at the first failure
        #[arg(long)]
        atomic: bool,
    },

    /// Print the effective configuration as YAML
    Config,

    /// Run a write/read/search workload in a scratch directory and report
    Bench {
        /// Files to create
        #[arg(long, default_value_t = 50)]
        files: usize,
        /// Read and search passes over the files
        #[arg(long, default_value_t = 3)]
        iterations: usize,
    },
}

#[derive(Args)]
struct SearchArgs {
    /// Pattern to search for
    pattern: String,

    /// Directories to search (default: every allowed directory)
    #[arg(short = 'd', long = "root")]
    roots: Vec<PathBuf>,

    /// Treat the pattern as a regular expression
    #[arg(short = 'r', long)]
    regex: bool,

    #[arg(short = 'i', long)]
    ignore_case: bool,

    /// File extensions to include (e.g. rs,go,js)
    #[arg(short = 'e', long)]
    extensions: Option<String>,

    /// Patterns to exclude (glob format)
    #[arg(short = 'x', long)]
    exclude: Vec<String>,

    /// Stop after this many matches
    #[arg(short = 'm', long)]
    max_results: Option<usize>,

    /// Match file names instead of contents
    #[arg(long)]
    names: bool,

    /// Include hidden files and directories
    #[arg(long)]
    hidden: bool,

    /// Show only statistics, not matches
    #[arg(short, long)]
    summary: bool,
}

fn parse_size_arg(s: &str) -> std::result::Result<u64, String> {
    parse_size(s).map_err(|e| e.to_string())
}

fn parse_log_level(s: &str) -> std::result::Result<LogLevel, String> {
    LogLevel::parse(s).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    run()
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.engine)?;
    init_tracing(config.log_level);

    debug!(
        allowed_dirs = ?config.allowed_dirs,
        parallel_ops = config.parallel_ops,
        "configuration loaded"
    );

    let engine = Engine::new(config)?;
    let result = dispatch(&engine, cli.command, cli.json);

    if cli.stats {
        print_json_to(&mut io::stderr(), &engine.report())?;
    }
    engine.shutdown();
    result
}

fn load_config(args: &EngineArgs) -> Result<EngineConfig> {
    let file_config = EngineConfig::load_from(args.config.as_deref())
        .map_err(|e| EngineError::config_error(e.to_string()))?;

    let mut config = file_config.merge_with_cli(ConfigOverrides {
        allowed_dirs: args.allowed_dirs.clone(),
        cache_size: args.cache_size,
        parallel_ops: args.parallel_ops,
        queue_bound: args.queue_bound,
        binary_threshold: args.binary_threshold,
        mmap_threshold: args.mmap_threshold,
        mmap_enabled: args.no_mmap.then_some(false),
        backup_dir: args.backup_dir.clone(),
        log_level: args.log_level,
    });

    if config.allowed_dirs.is_empty() {
        config.allowed_dirs.push(PathBuf::from("."));
    }
    Ok(config)
}

fn init_tracing(level: LogLevel) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ultrafs={}", level.as_filter())));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn dispatch(engine: &Engine, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Read { path } => {
            let output = engine.read(&path)?;
            if json {
                print_json(&output)
            } else {
                write_payload(&output)
            }
        }
        Commands::ReadMultiple { paths } => {
            let outcomes = engine.read_multiple(&paths);
            if json {
                return print_json(&outcomes);
            }
            for outcome in &outcomes {
                print_read_outcome(outcome);
            }
            Ok(())
        }
        Commands::Write {
            path,
            content,
            backup,
        } => {
            let bytes = match content {
                Some(text) => text.into_bytes(),
                None => read_stdin()?,
            };
            let outcome = engine.write_safe(&path, &bytes, backup)?;
            if json {
                return print_json(&outcome);
            }
            println!(
                "Wrote {} to {}",
                format_size(outcome.bytes_written),
                outcome.path.display().to_string().blue()
            );
            print_backup(outcome.backup.as_deref());
            Ok(())
        }
        Commands::Edit {
            path,
            find,
            replace,
            first,
            nth,
            backup,
        } => {
            let scope = match (first, nth) {
                (_, Some(n)) => EditScope::Nth(n),
                (true, None) => EditScope::First,
                (false, None) => EditScope::All,
            };
            let outcome = engine.edit(&path, &find, &replace, scope, backup)?;
            if json {
                return print_json(&outcome);
            }
            if outcome.replacements == 0 {
                println!("No occurrences of '{}' in {}", find, path.display());
            } else {
                println!(
                    "Replaced {} occurrence(s) of '{}' with '{}' in {}",
                    outcome.replacements,
                    find.red(),
                    replace.green(),
                    outcome.path.display().to_string().blue()
                );
            }
            print_backup(outcome.backup.as_deref());
            Ok(())
        }
        Commands::Move { from, to } => {
            let dest = engine.move_path(&from, &to)?;
            print_path_result(json, "Moved", &from, &dest)
        }
        Commands::Copy { from, to } => {
            let dest = engine.copy_path(&from, &to)?;
            print_path_result(json, "Copied", &from, &dest)
        }
        Commands::Delete { path, recursive } => {
            engine.delete(&path, recursive)?;
            if json {
                return print_json(&serde_json::json!({ "deleted": path }));
            }
            println!("Deleted {}", path.display());
            Ok(())
        }
        Commands::List { path } => {
            let entries = engine.list_directory(&path)?;
            if json {
                return print_json(&entries);
            }
            print_listing(&entries);
            Ok(())
        }
        Commands::Mkdir { path } => {
            let dir = engine.create_directory(&path)?;
            if json {
                return print_json(&serde_json::json!({ "created": dir }));
            }
            println!("Created {}", dir.display().to_string().blue());
            Ok(())
        }
        Commands::Search(args) => run_search(engine, args, json),
        Commands::Compare { a, b } => {
            let comparison = engine.compare(&a, &b)?;
            if json {
                return print_json(&comparison);
            }
            print_comparison(&comparison);
            Ok(())
        }
        Commands::Analyze { path } => {
            let analysis = engine.analyze_file(&path)?;
            if json {
                return print_json(&analysis);
            }
            print_file_analysis(&analysis);
            Ok(())
        }
        Commands::AnalyzeProject { root } => {
            let analysis = engine.analyze_project(&root)?;
            if json {
                return print_json(&analysis);
            }
            print_project_analysis(&analysis);
            Ok(())
        }
        Commands::Duplicates { root } => {
            let groups = engine.find_duplicates(&root)?;
            if json {
                return print_json(&groups);
            }
            print_duplicates(&groups);
            Ok(())
        }
        Commands::ChunkedWrite { path, chunk_size } => {
            let bytes = read_stdin()?;
            let chunk_size = usize::try_from(chunk_size)
                .map_err(|_| EngineError::invalid_argument("chunk size too large"))?;
            let outcome = engine.chunked_write(&path, &bytes, chunk_size, &engine.token())?;
            if json {
                return print_json(&outcome);
            }
            println!(
                "Wrote {} to {}",
                format_size(outcome.bytes_written),
                outcome.path.display().to_string().blue()
            );
            Ok(())
        }
        Commands::Split {
            path,
            chunk_size,
            out_dir,
        } => {
            let chunk_size = usize::try_from(chunk_size)
                .map_err(|_| EngineError::invalid_argument("chunk size too large"))?;
            let parts = engine.split_file(&path, chunk_size, &out_dir)?;
            if json {
                return print_json(&parts);
            }
            println!("Split {} into {} parts:", path.display(), parts.len());
            for part in &parts {
                println!("  {}", part.display());
            }
            Ok(())
        }
        Commands::Join { parts, dest } => {
            let outcome = engine.join_files(&parts, &dest)?;
            if json {
                return print_json(&outcome);
            }
            println!(
                "Joined {} parts into {} ({})",
                parts.len(),
                outcome.path.display().to_string().blue(),
                format_size(outcome.bytes_written)
            );
            Ok(())
        }
        Commands::Batch { file, atomic } => run_batch(engine, &file, atomic, json),
        Commands::Config => {
            if json {
                return print_json(engine.config());
            }
            print!("{}", engine.config().to_yaml()?);
            Ok(())
        }
        Commands::Bench { files, iterations } => run_bench(engine, files, iterations, json),
    }
}

fn run_search(engine: &Engine, args: SearchArgs, json: bool) -> Result<()> {
    let file_types = args
        .extensions
        .as_ref()
        .map(|e| {
            e.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let options = SearchOptions {
        regex: args.regex,
        case_sensitive: !args.ignore_case,
        file_types,
        max_results: args.max_results,
        content_search: !args.names,
        exclude_patterns: args.exclude,
        include_hidden: args.hidden,
    };

    let stream = engine.search(&args.roots, &args.pattern, &options, &engine.token())?;

    if json {
        // One JSON object per line, as matches arrive
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for m in stream {
            let m = m?;
            let line = serde_json::to_string(&m)
                .map_err(|e| EngineError::invalid_argument(e.to_string()))?;
            writeln!(out, "{}", line).map_err(|e| EngineError::io("<stdout>", e))?;
        }
        return Ok(());
    }

    let summary: SearchSummary = stream.collect::<Result<_>>()?;
    print_search_results(&summary, args.summary);
    Ok(())
}

fn run_batch(engine: &Engine, file: &Path, atomic: bool, json: bool) -> Result<()> {
    let text = fs::read_to_string(file).map_err(|e| EngineError::io(file, e))?;
    let ops: Vec<Operation> = serde_json::from_str(&text).map_err(|e| {
        EngineError::invalid_argument(format!("invalid batch file {}: {}", file.display(), e))
    })?;
    let mode = if atomic {
        BatchMode::Atomic
    } else {
        BatchMode::Independent
    };

    let outcomes = engine.batch(&ops, mode, &engine.token());
    if json {
        return print_json(&outcomes);
    }

    let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
    for (op, outcome) in ops.iter().zip(&outcomes) {
        match &outcome.result {
            Ok(output) => println!(
                "{} {} {}",
                "ok".green(),
                op.kind().name(),
                describe_output(output, &outcome.path)
            ),
            Err(e) => println!(
                "{} {} {}: {}",
                "failed".red(),
                op.kind().name(),
                outcome.path.display(),
                e.message
            ),
        }
    }
    println!(
        "\n{} of {} operations succeeded",
        outcomes.len() - failed,
        outcomes.len()
    );
    Ok(())
}

fn run_bench(engine: &Engine, files: usize, iterations: usize, json: bool) -> Result<()> {
    let scratch = PathBuf::from(format!("ultrafs-bench-{}", std::process::id()));
    let started = Instant::now();

    engine.create_directory(&scratch)?;
    let workload = bench_workload(engine, &scratch, files.max(1), iterations.max(1));
    let cleanup = engine.delete(&scratch, true);
    workload?;
    cleanup?;

    let report = engine.report();
    if json {
        return print_json(&report);
    }
    print_bench_report(&report, started.elapsed());
    Ok(())
}

fn bench_workload(engine: &Engine, scratch: &Path, files: usize, iterations: usize) -> Result<()> {
    let paths: Vec<PathBuf> = (0..files)
        .map(|i| scratch.join(format!("file_{i:04}.txt")))
        .collect();
    for (i, path) in paths.iter().enumerate() {
        let body = format!("benchmark file {i}\nneedle {i}\n").repeat(64);
        engine.write_safe(path, body.as_bytes(), false)?;
    }

    for pass in 0..iterations {
        for path in &paths {
            engine.read(path)?;
        }
        let failed = engine
            .read_multiple(&paths)
            .iter()
            .filter(|outcome| !outcome.is_ok())
            .count();

        let matches = engine
            .search(&[scratch], "needle", &SearchOptions::default(), &engine.token())?
            .collect::<Result<Vec<_>>>()?;
        debug!(pass, failed, matches = matches.len(), "benchmark pass complete");
    }
    Ok(())
}

fn print_bench_report(report: &PerformanceReport, elapsed: Duration) {
    println!("{}", "Benchmark results".bold());
    println!("  elapsed:            {}", humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)));
    println!("  operations:         {} ({} failed)", report.total_operations, report.failed_operations);
    println!("  throughput:         {:.1} ops/s", report.operations_per_second);
    println!("  average response:   {:.3} ms", report.average_response_ms);
    println!("  memory efficiency:  {:.1}%", report.memory_efficiency_percent);
    println!("  cache hit rate:     {:.1}%", report.cache.hit_rate * 100.0);

    println!("\nBy operation:");
    for (kind, stats) in &report.per_operation {
        println!(
            "  {:<16} {:>6} calls  {:>9.3} ms avg",
            kind.name(),
            stats.count,
            stats.average_ms
        );
    }
}

fn describe_output(output: &OperationOutput, path: &Path) -> String {
    match output {
        OperationOutput::Read(read) => format!("{} ({})", path.display(), format_size(read.size)),
        OperationOutput::ReadMultiple(items) => format!("{} file(s)", items.len()),
        OperationOutput::Write(w) => format!("{} ({})", w.path.display(), format_size(w.bytes_written)),
        OperationOutput::Edit(e) => format!("{} ({} replacement(s))", e.path.display(), e.replacements),
        OperationOutput::Path(p) => p.display().to_string(),
        OperationOutput::Deleted => path.display().to_string(),
        OperationOutput::Listing(entries) => format!("{} entries", entries.len()),
        OperationOutput::Matches(matches) => format!("{} match(es)", matches.len()),
        OperationOutput::Comparison(c) => {
            if c.identical {
                "identical".to_string()
            } else {
                format!("{} hunk(s)", c.hunks.len())
            }
        }
        OperationOutput::FileAnalysis(a) => format!("{} lines", a.lines),
        OperationOutput::ProjectAnalysis(a) => format!("{} files", a.files),
        OperationOutput::Duplicates(groups) => format!("{} duplicate group(s)", groups.len()),
        OperationOutput::Parts(parts) => format!("{} part(s)", parts.len()),
    }
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    io::stdin()
        .read_to_end(&mut buf)
        .map_err(|e| EngineError::io("<stdin>", e))?;
    Ok(buf)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    print_json_to(&mut io::stdout(), value)
}

fn print_json_to<T: Serialize>(out: &mut dyn Write, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| EngineError::invalid_argument(e.to_string()))?;
    writeln!(out, "{}", text).map_err(|e| EngineError::io("<output>", e))
}

fn write_payload(output: &ReadOutput) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    out.write_all(&output.content)
        .and_then(|()| out.flush())
        .map_err(|e| EngineError::io("<stdout>", e))
}

fn print_read_outcome(outcome: &ItemOutcome<ReadOutput>) {
    println!("\n{}", outcome.path.display().to_string().blue());
    match &outcome.result {
        Ok(output) if output.encoding == PayloadEncoding::Inline => {
            println!("{}", output.content.to_string_lossy());
        }
        Ok(output) => println!("<{} of binary payload>", format_size(output.size)),
        Err(e) => println!("{}", e.message.red()),
    }
}

fn print_backup(backup: Option<&Path>) {
    if let Some(backup) = backup {
        println!("Backup saved to {}", backup.display());
    }
}

fn print_path_result(json: bool, verb: &str, from: &Path, dest: &Path) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({ "from": from, "to": dest }));
    }
    println!(
        "{} {} to {}",
        verb,
        from.display(),
        dest.display().to_string().blue()
    );
    Ok(())
}

fn print_listing(entries: &[DirEntryInfo]) {
    for entry in entries {
        let age = entry
            .modified
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .map(|d| format!("{} ago", humantime::format_duration(Duration::from_secs(d.as_secs()))))
            .unwrap_or_default();
        match entry.kind {
            EntryKind::Directory => println!("{:>10}  {}/  {}", "-", entry.name.blue(), age),
            EntryKind::Symlink => println!("{:>10}  {}@  {}", "-", entry.name.cyan(), age),
            _ => println!("{:>10}  {}  {}", format_size(entry.size), entry.name, age),
        }
    }
}

fn print_search_results(summary: &SearchSummary, summary_only: bool) {
    if !summary_only {
        for file_result in &summary.file_results {
            println!("\n{}", file_result.path.display().to_string().blue());
            for m in &file_result.matches {
                let line = &m.line;
                let (start, end) = (m.start.min(line.len()), m.end.min(line.len()));
                match (line.get(..start), line.get(start..end), line.get(end..)) {
                    (Some(before), Some(hit), Some(after)) => println!(
                        "{}: {}{}{}",
                        m.line_number.to_string().green(),
                        before,
                        hit.red().bold(),
                        after
                    ),
                    _ => println!("{}: {}", m.line_number.to_string().green(), line),
                }
            }
        }
    }

    println!(
        "\nFound {} matches in {} files",
        summary.total_matches, summary.files_with_matches
    );
}

fn print_comparison(comparison: &Comparison) {
    if comparison.identical {
        println!("Files are identical");
        return;
    }
    for line in comparison.unified_diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            println!("{}", line.bold());
        } else if line.starts_with('+') {
            println!("{}", line.green());
        } else if line.starts_with('-') {
            println!("{}", line.red());
        } else if line.starts_with("@@") {
            println!("{}", line.cyan());
        } else {
            println!("{}", line);
        }
    }
    println!("\nSimilarity: {:.1}%", comparison.ratio * 100.0);
}

fn print_file_analysis(analysis: &FileAnalysis) {
    println!("{}", analysis.path.display().to_string().blue());
    println!("  size:      {}", format_size(analysis.size));
    if analysis.is_binary {
        println!("  content:   binary");
    } else {
        println!("  lines:     {}", analysis.lines);
        println!("  words:     {}", analysis.words);
    }
    if let Some(ext) = &analysis.extension {
        println!("  extension: {}", ext);
    }
    println!("  access:    {:?}", analysis.access_strategy);
}

fn print_project_analysis(analysis: &ProjectAnalysis) {
    println!("{}", analysis.root.display().to_string().blue());
    println!(
        "{} files in {} directories, {}",
        analysis.files,
        analysis.directories,
        format_size(analysis.total_size)
    );

    println!("\nBy extension:");
    for (ext, stats) in &analysis.by_extension {
        println!("  {:<12} {:>6} files  {:>10}", ext, stats.files, format_size(stats.bytes));
    }

    println!("\nLargest files:");
    for file in &analysis.largest {
        println!("  {:>10}  {}", format_size(file.size), file.path.display());
    }
}

fn print_duplicates(groups: &[DuplicateGroup]) {
    if groups.is_empty() {
        println!("No duplicate files found");
        return;
    }
    let wasted: u64 = groups
        .iter()
        .map(|g| g.size * (g.paths.len() as u64 - 1))
        .sum();
    for group in groups {
        println!(
            "\n{} ({} each, sha256 {})",
            format!("{} copies", group.paths.len()).yellow(),
            format_size(group.size),
            group.digest.get(..12).unwrap_or(&group.digest)
        );
        for path in &group.paths {
            println!("  {}", path.display());
        }
    }
    println!(
        "\n{} duplicate group(s), {} reclaimable",
        groups.len(),
        format_size(wasted)
    );
}
