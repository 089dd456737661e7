//! pgcensusd - PostgreSQL connection census exporter.
//!
//! Periodically counts sessions per user, client host and database and
//! publishes them in the Prometheus text format, either on stdout or as a
//! node-exporter textfile.

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Parser;
use postgres::{CancelToken, NoTls};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgcensus_core::collector::{CensusSource, ConnectionCensus, PostgresSource, Scraper};
use pgcensus_core::metrics::{CensusMetrics, MetricObservation};

/// PostgreSQL connection census exporter.
#[derive(Parser, Debug)]
#[command(
    name = "pgcensusd",
    about = "PostgreSQL connection census exporter",
    version
)]
struct Args {
    /// Connection string (libpq key=value or URL).
    /// Defaults to PGHOST/PGPORT/PGUSER/PGPASSWORD/PGDATABASE.
    #[arg(long)]
    dsn: Option<String>,

    /// Scrape interval in seconds.
    #[arg(short, long, default_value = "15")]
    interval: u64,

    /// Scrape once and exit (non-zero exit status on failure).
    #[arg(long)]
    once: bool,

    /// Write metrics to this file (atomically replaced) instead of stdout.
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Connect and statement timeout in seconds.
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = log_level(verbose, quiet);

    let mut filter = EnvFilter::from_default_env();
    for target in ["pgcensusd", "pgcensus_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn log_level(verbose: u8, quiet: bool) -> Level {
    if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

fn build_source(args: &Args) -> Result<PostgresSource, String> {
    let source = match args.dsn {
        Some(ref dsn) => PostgresSource::with_connection_string(dsn),
        None => PostgresSource::from_env(),
    }
    .map_err(|e| e.to_string())?;

    Ok(match args.timeout {
        Some(secs) => source.with_timeout(Duration::from_secs(secs)),
        None => source,
    })
}

/// Runs one scrape and publishes its outcome. Returns true on success.
fn scrape_once(
    scraper: &dyn Scraper,
    source: &mut dyn CensusSource,
    metrics: &CensusMetrics,
) -> bool {
    let started = Instant::now();

    if let Some(version) = source.server_version()
        && !scraper.supports(version)
    {
        warn!(
            collector = scraper.name(),
            server_version = version,
            minimum_version = scraper.minimum_version(),
            "server version not supported, skipping scrape"
        );
        metrics.record_failure(scraper.name());
        return false;
    }

    let mut observations: Vec<MetricObservation> = Vec::new();
    let result = scraper.scrape(source, &mut observations);
    metrics.observe_duration(started.elapsed());

    match result {
        Ok(()) => {
            metrics.publish(&observations);
            debug!(
                collector = scraper.name(),
                observations = observations.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "scrape finished"
            );
            true
        }
        Err(e) => {
            error!(collector = scraper.name(), error = %e, "scrape failed");
            metrics.record_failure(scraper.name());
            false
        }
    }
}

/// One daemon tick: a single connection attempt, then the scrape.
///
/// The cancel token is refreshed right after the connect, so the Ctrl-C
/// handler always targets the connection the scrape will run on. A failed
/// connect is recorded as a scrape failure without trying again.
fn run_tick(
    scraper: &dyn Scraper,
    source: &mut PostgresSource,
    metrics: &CensusMetrics,
    cancel: &Mutex<Option<CancelToken>>,
) -> bool {
    let connected = source.try_connect();
    if let Ok(mut guard) = cancel.lock() {
        *guard = source.cancel_token();
    }

    if let Err(e) = connected {
        error!(collector = scraper.name(), error = %e, "scrape failed");
        metrics.record_failure(scraper.name());
        return false;
    }

    scrape_once(scraper, source, metrics)
}

/// Writes `contents` to `path` through a temporary file in the same directory,
/// so readers never see a partially written file.
fn write_textfile(path: &Path, contents: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn export(metrics: &CensusMetrics, output: Option<&Path>) {
    let text = match metrics.encode() {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            return;
        }
    };

    match output {
        Some(path) => {
            if let Err(e) = write_textfile(path, &text) {
                error!("Failed to write {}: {}", path.display(), e);
            }
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = stdout.write_all(text.as_bytes()).and_then(|()| stdout.flush()) {
                error!("Failed to write metrics to stdout: {}", e);
            }
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    info!("pgcensusd {} starting", env!("CARGO_PKG_VERSION"));

    let mut source = match build_source(&args) {
        Ok(source) => source,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let metrics = match CensusMetrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("Failed to register metrics: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let scraper = ConnectionCensus;
    info!(
        "Config: collector={}, interval={}s, output={}",
        scraper.name(),
        args.interval,
        args.output
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "stdout".to_string())
    );

    // Setup graceful shutdown; an in-flight census query is cancelled server-side.
    let running = Arc::new(AtomicBool::new(true));
    let cancel: Arc<Mutex<Option<CancelToken>>> = Arc::new(Mutex::new(None));
    let r = running.clone();
    let c = cancel.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
        if let Ok(guard) = c.lock()
            && let Some(token) = guard.as_ref()
            && let Err(e) = token.cancel_query(NoTls)
        {
            debug!("Failed to cancel in-flight query: {}", e);
        }
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let interval = Duration::from_secs(args.interval);
    let mut scrape_count: u64 = 0;

    while running.load(Ordering::SeqCst) {
        let ok = run_tick(&scraper, &mut source, &metrics, &cancel);
        scrape_count += 1;
        export(&metrics, args.output.as_deref());

        if args.once {
            return if ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }

        if scrape_count.is_multiple_of(240) {
            info!("Completed {} scrapes", scrape_count);
        }

        // Sleep with periodic checks for shutdown signal
        let sleep_interval = Duration::from_millis(100);
        let mut remaining = interval;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let sleep_time = remaining.min(sleep_interval);
            std::thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgcensus_core::collector::MockSource;
    use pgcensus_core::metrics::METRIC_NAME;

    #[test]
    fn args_defaults() {
        let args = Args::try_parse_from(["pgcensusd"]).unwrap();
        assert_eq!(args.interval, 15);
        assert!(!args.once);
        assert!(args.output.is_none());
        assert!(args.dsn.is_none());
        assert_eq!(log_level(args.verbose, args.quiet), Level::INFO);
    }

    #[test]
    fn args_parse_flags() {
        let args = Args::try_parse_from([
            "pgcensusd",
            "--dsn",
            "host=db user=exporter",
            "--once",
            "-o",
            "/tmp/census.prom",
            "--timeout",
            "5",
            "-vv",
        ])
        .unwrap();
        assert_eq!(args.dsn.as_deref(), Some("host=db user=exporter"));
        assert!(args.once);
        assert_eq!(args.output, Some(PathBuf::from("/tmp/census.prom")));
        assert_eq!(args.timeout, Some(5));
        assert_eq!(log_level(args.verbose, args.quiet), Level::TRACE);
    }

    #[test]
    fn quiet_wins_over_verbose() {
        assert_eq!(log_level(2, true), Level::ERROR);
        assert_eq!(log_level(1, false), Level::DEBUG);
    }

    #[test]
    fn build_source_rejects_invalid_dsn() {
        let args = Args::try_parse_from(["pgcensusd", "--dsn", "port=notaport"]).unwrap();
        assert!(build_source(&args).is_err());
    }

    #[test]
    fn scrape_once_publishes_on_success() {
        let metrics = CensusMetrics::new().unwrap();
        let mut source = MockSource::typical_cluster();
        assert!(scrape_once(&ConnectionCensus, &mut source, &metrics));

        let text = metrics.encode().unwrap();
        assert!(text.contains(METRIC_NAME));
        assert!(text.contains("pg_exporter_last_scrape_error 0"));
    }

    #[test]
    fn scrape_once_records_failure() {
        let metrics = CensusMetrics::new().unwrap();
        let mut source = MockSource::typical_cluster().fail_query("connection refused");
        assert!(!scrape_once(&ConnectionCensus, &mut source, &metrics));

        let text = metrics.encode().unwrap();
        assert!(!text.contains(&format!("{}{{", METRIC_NAME)));
        assert!(text.contains("pg_exporter_last_scrape_error 1"));
        assert!(text.contains("pg_exporter_scrape_errors_total{collector=\"processlist\"} 1"));
    }

    #[test]
    fn scrape_once_skips_unsupported_server() {
        let metrics = CensusMetrics::new().unwrap();
        let mut source = MockSource::typical_cluster().with_server_version(9.1);
        assert!(!scrape_once(&ConnectionCensus, &mut source, &metrics));
        assert_eq!(source.cursors_opened(), 0);
    }

    /// Accepts TCP connections and closes them before the startup handshake.
    fn closing_listener() -> std::net::SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                drop(stream);
            }
        });
        addr
    }

    #[test]
    fn run_tick_connects_once_when_server_is_unreachable() {
        let addr = closing_listener();
        let dsn = format!("host={} port={} user=app dbname=app", addr.ip(), addr.port());
        let args = Args::try_parse_from(["pgcensusd", "--dsn", dsn.as_str(), "--timeout", "5"]).unwrap();
        let mut source = build_source(&args).unwrap();
        let metrics = CensusMetrics::new().unwrap();
        let cancel = Mutex::new(None);

        assert!(!run_tick(&ConnectionCensus, &mut source, &metrics, &cancel));
        assert_eq!(source.connect_attempts(), 1);
        assert!(cancel.lock().unwrap().is_none());

        let text = metrics.encode().unwrap();
        assert!(text.contains("pg_exporter_last_scrape_error 1"));
        assert!(text.contains("pg_exporter_scrape_errors_total{collector=\"processlist\"} 1"));

        assert!(!run_tick(&ConnectionCensus, &mut source, &metrics, &cancel));
        assert_eq!(source.connect_attempts(), 2);
        let text = metrics.encode().unwrap();
        assert!(text.contains("pg_exporter_scrape_errors_total{collector=\"processlist\"} 2"));
    }

    #[test]
    fn write_textfile_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("census.prom");

        write_textfile(&path, "first\n").unwrap();
        write_textfile(&path, "second\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
