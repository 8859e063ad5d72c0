use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dedupbench_core::{
    BenchmarkPlan, EngineConfig, EngineEvent, EngineHandle, EngineWorker, HashAlgorithm, LogLevel,
    Namespace, RecoverRequest, RunResult, SegmentRequest, StoreDialect,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Parser)]
#[command(name = "dedupbench")]
#[command(about = "Fixed-size block dedup benchmark: segment, recover and compare block sizes", long_about = None)]
pub struct Cli {
    /// Engine config file (.toml or .json)
    #[arg(short, long, env = "DEDUPBENCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Index store dialect: memory or wal
    #[arg(long)]
    pub dialect: Option<StoreDialect>,

    /// Root directory of file-backed databases
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Database name
    #[arg(long)]
    pub database: Option<String>,

    /// Store user
    #[arg(long, env = "DEDUPBENCH_USER")]
    pub user: Option<String>,

    /// Store password
    #[arg(long, env = "DEDUPBENCH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,

    /// Print engine metrics when done
    #[arg(long)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Split a file into blocks, count them and write a hash-block trail
    Segment {
        source: PathBuf,
        /// Trail path, defaults to `<source>.hb`
        #[arg(short, long)]
        trail: Option<PathBuf>,
        #[arg(short, long, default_value = "4096")]
        block_size: u64,
        #[arg(short, long, default_value = "sha256")]
        algorithm: HashAlgorithm,
        /// Replace an existing trail
        #[arg(long)]
        overwrite: bool,
    },
    /// Rebuild a file from a trail and the index
    Recover {
        trail: PathBuf,
        output: PathBuf,
        #[arg(short, long, default_value = "4096")]
        block_size: u64,
        #[arg(short, long, default_value = "sha256")]
        algorithm: HashAlgorithm,
        /// Replace an existing output
        #[arg(long)]
        overwrite: bool,
    },
    /// Segment and recover once per block size
    Bench {
        source: PathBuf,
        /// Comma separated, defaults to the config
        #[arg(short, long, value_delimiter = ',')]
        block_sizes: Vec<u64>,
        #[arg(short, long)]
        algorithm: Option<HashAlgorithm>,
        #[arg(long)]
        work_dir: Option<PathBuf>,
        /// Keep trails and recovered files
        #[arg(long)]
        keep_artifacts: bool,
    },
    /// List namespaces in the database
    Namespaces,
    /// Distinct digests in one namespace
    Count {
        #[arg(short, long)]
        block_size: u64,
        #[arg(short, long)]
        algorithm: HashAlgorithm,
    },
    /// Delete one namespace
    DropNamespace {
        #[arg(short, long)]
        block_size: u64,
        #[arg(short, long)]
        algorithm: HashAlgorithm,
    },
    /// Delete the whole database
    DropDatabase,
}

impl Cli {
    /// Config file (or defaults) with command-line overrides applied.
    pub fn load_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => EngineConfig::default(),
        };
        let conn = &mut config.connection;
        if let Some(dialect) = self.dialect {
            conn.dialect = dialect;
        }
        if let Some(dir) = &self.data_dir {
            conn.data_dir = dir.clone();
        }
        if let Some(db) = &self.database {
            conn.database = db.clone();
        }
        if let Some(user) = &self.user {
            conn.user = user.clone();
        }
        if let Some(password) = &self.password {
            conn.password = password.clone();
        }
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(print_events(rx));
        let handle = EngineWorker::start(&config, Arc::new(tx));

        let outcome = self.execute(&handle, &config).await;
        if outcome.is_ok() && self.metrics {
            print!("{}", handle.metrics().render_text());
        }
        handle.shutdown().await?;
        // the worker held the last event sender
        let _ = printer.await;
        outcome
    }

    async fn execute(&self, handle: &EngineHandle, config: &EngineConfig) -> Result<()> {
        handle
            .connect(config.connection_params())
            .await
            .context("connecting to the dedup index")?;

        match &self.command {
            Command::Segment {
                source,
                trail,
                block_size,
                algorithm,
                overwrite,
            } => {
                let trail = trail.clone().unwrap_or_else(|| default_trail(source));
                let request = SegmentRequest {
                    source: source.clone(),
                    trail: trail.clone(),
                    block_size: *block_size,
                    algorithm: *algorithm,
                    overwrite: *overwrite,
                };
                let stats = interruptible(handle, handle.segment(request)).await?;
                let row = RunResult::new(source, *algorithm, *block_size)
                    .with_trail(trail)
                    .with_segmentation(&stats);
                self.print_rows(&[row])?;
            }
            Command::Recover {
                trail,
                output,
                block_size,
                algorithm,
                overwrite,
            } => {
                let request = RecoverRequest {
                    trail: trail.clone(),
                    output: output.clone(),
                    block_size: *block_size,
                    algorithm: *algorithm,
                    overwrite: *overwrite,
                };
                let stats = interruptible(handle, handle.recover(request)).await?;
                let row = RunResult::for_trail(trail, *algorithm, *block_size).with_recovery(&stats);
                self.print_rows(&[row])?;
            }
            Command::Bench {
                source,
                block_sizes,
                algorithm,
                work_dir,
                keep_artifacts,
            } => {
                let plan = self.bench_plan(config, source, block_sizes, *algorithm, work_dir, *keep_artifacts);
                let rows = interruptible(handle, handle.benchmark(plan)).await?;
                self.print_rows(&rows)?;
            }
            Command::Namespaces => {
                for ns in handle.list_namespaces().await? {
                    println!("{}", ns);
                }
            }
            Command::Count {
                block_size,
                algorithm,
            } => {
                let ns = Namespace::new(*block_size, *algorithm)?;
                println!("{}", handle.row_count(ns).await?);
            }
            Command::DropNamespace {
                block_size,
                algorithm,
            } => {
                let ns = Namespace::new(*block_size, *algorithm)?;
                let removed = handle.drop_namespace(ns).await?;
                println!("dropped {} ({} records)", ns, removed);
            }
            Command::DropDatabase => {
                handle.disconnect(true).await?;
                return Ok(());
            }
        }
        handle.disconnect(false).await?;
        Ok(())
    }

    fn bench_plan(
        &self,
        config: &EngineConfig,
        source: &Path,
        block_sizes: &[u64],
        algorithm: Option<HashAlgorithm>,
        work_dir: &Option<PathBuf>,
        keep_artifacts: bool,
    ) -> BenchmarkPlan {
        let mut plan = config.plan_for(source);
        if !block_sizes.is_empty() {
            plan.block_sizes = block_sizes.to_vec();
        }
        if let Some(alg) = algorithm {
            plan.algorithm = alg;
        }
        if let Some(dir) = work_dir {
            plan.work_dir = dir.clone();
        }
        plan.keep_artifacts |= keep_artifacts;
        plan
    }

    fn print_rows(&self, rows: &[RunResult]) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(rows)?);
        } else {
            print!("{}", format_table(rows));
        }
        Ok(())
    }
}

fn default_trail(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_owned();
    name.push(".hb");
    PathBuf::from(name)
}

/// Await `fut`, turning Ctrl-C into a cancellation of the running request.
async fn interruptible<T>(handle: &EngineHandle, fut: impl Future<Output = T>) -> T {
    tokio::pin!(fut);
    tokio::select! {
        out = &mut fut => return out,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling at the next block");
            handle.cancel();
        }
    }
    fut.await
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = rx.recv().await {
        if let Some(line) = render_event(&event) {
            eprintln!("{}", line);
        }
    }
}

/// One stderr line per event worth showing.
pub fn render_event(event: &EngineEvent) -> Option<String> {
    match event {
        EngineEvent::Progress(p) => Some(format!(
            "{} {:5.1}% ({} blocks, {} bytes)",
            p.kind,
            p.percent(),
            p.blocks_done,
            p.bytes_done
        )),
        EngineEvent::Log(line) => {
            let tag = match line.level {
                LogLevel::Info => "info",
                LogLevel::Success => "ok",
                LogLevel::Warning => "warn",
                LogLevel::Error => "error",
            };
            Some(format!("[{}] {}", tag, line.message))
        }
        EngineEvent::PhaseChanged { .. } | EngineEvent::RunResult(_) => None,
    }
}

/// Fixed-width table of result rows.
pub fn format_table(rows: &[RunResult]) -> String {
    let cells: Vec<[String; 11]> = rows.iter().map(RunResult::cells).collect();
    let mut widths: Vec<usize> = RunResult::COLUMNS.iter().map(|c| c.len()).collect();
    for row in &cells {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.len());
        }
    }
    let mut out = String::new();
    push_line(&mut out, &widths, RunResult::COLUMNS.iter().copied());
    for row in &cells {
        push_line(&mut out, &widths, row.iter().map(String::as_str));
    }
    out
}

fn push_line<'a>(out: &mut String, widths: &[usize], values: impl Iterator<Item = &'a str>) {
    let joined: Vec<String> = values
        .zip(widths)
        .map(|(v, w)| format!("{:>width$}", v, width = *w))
        .collect();
    out.push_str(joined.join("  ").trim_end());
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedupbench_core::{LogLine, Progress, RunKind};
    use std::io::Write;

    #[test]
    fn test_cli_segment_defaults() {
        let cli = Cli::parse_from(["dedupbench", "segment", "/data/a.img"]);
        match &cli.command {
            Command::Segment {
                source,
                trail,
                block_size,
                algorithm,
                overwrite,
            } => {
                assert_eq!(source, &PathBuf::from("/data/a.img"));
                assert!(trail.is_none());
                assert_eq!(*block_size, 4096);
                assert_eq!(*algorithm, HashAlgorithm::Sha256);
                assert!(!overwrite);
                assert_eq!(default_trail(source), PathBuf::from("/data/a.img.hb"));
            }
            other => panic!("Expected Segment command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_bench_block_size_list() {
        let cli = Cli::parse_from([
            "dedupbench",
            "bench",
            "src.bin",
            "--block-sizes",
            "512,4096,65536",
            "-a",
            "sha-512",
        ]);
        match &cli.command {
            Command::Bench {
                block_sizes,
                algorithm,
                ..
            } => {
                assert_eq!(block_sizes, &vec![512, 4096, 65536]);
                assert_eq!(*algorithm, Some(HashAlgorithm::Sha512));
            }
            other => panic!("Expected Bench command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_count_requires_namespace() {
        assert!(Cli::try_parse_from(["dedupbench", "count"]).is_err());
        let cli = Cli::try_parse_from(["dedupbench", "count", "-b", "1024", "-a", "md5"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Count {
                block_size: 1024,
                algorithm: HashAlgorithm::Md5
            }
        );
    }

    #[test]
    fn test_cli_rejects_unknown_algorithm() {
        assert!(Cli::try_parse_from(["dedupbench", "segment", "x", "-a", "crc32"]).is_err());
    }

    #[test]
    fn test_overrides_beat_config_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "[connection]\ndialect = \"wal\"\ndatabase = \"from_file\"\n[benchmark]\nblock_sizes = [128]"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::parse_from([
            "dedupbench",
            "--config",
            &path,
            "--dialect",
            "memory",
            "--database",
            "from_flag",
            "bench",
            "s.bin",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.connection.dialect, StoreDialect::Memory);
        assert_eq!(config.connection.database, "from_flag");

        let plan = cli.bench_plan(&config, Path::new("s.bin"), &[], None, &None, false);
        assert_eq!(plan.block_sizes, vec![128]);
        assert_eq!(plan.algorithm, HashAlgorithm::Sha256);
    }

    #[test]
    fn test_render_event() {
        let progress = EngineEvent::Progress(Progress {
            kind: RunKind::Recovery,
            blocks_done: 2,
            bytes_done: 50,
            bytes_total: 100,
        });
        assert_eq!(
            render_event(&progress).unwrap(),
            "recovery  50.0% (2 blocks, 50 bytes)"
        );
        let log = EngineEvent::Log(LogLine {
            level: LogLevel::Warning,
            message: "gone".into(),
        });
        assert_eq!(render_event(&log).unwrap(), "[warn] gone");
    }

    #[test]
    fn test_format_table_aligns_columns() {
        let row = RunResult::new("/tmp/a", HashAlgorithm::Md5, 4096);
        let table = format_table(&[row]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("block_size"));
        assert!(lines[1].contains("4096"));
        assert!(lines[1].contains("MD5"));
    }

    #[tokio::test]
    async fn test_bench_end_to_end_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.bin");
        std::fs::write(&source, vec![3u8; 5000]).unwrap();
        let work = dir.path().join("work");
        let cli = Cli::parse_from([
            "dedupbench",
            "--dialect",
            "memory",
            "--json",
            "bench",
            source.to_str().unwrap(),
            "--block-sizes",
            "1000",
            "--work-dir",
            work.to_str().unwrap(),
        ]);
        cli.run().await.unwrap();
        assert!(work.is_dir());
    }
}
