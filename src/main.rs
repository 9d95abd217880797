//! streamstress - open many RTSP sessions and watch them hold up.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use streamstress::config::{validate_targets, Settings};
use streamstress::db::{run_history_writer, HistoryRow, Store};
use streamstress::monitor::{AggregateView, EventRecord, Monitor, StreamTarget, TargetId};
use streamstress::probe::RtspConnector;
use streamstress::rtsp::Transport;
use streamstress::{logging, report};

#[derive(Parser, Debug)]
#[command(name = "streamstress", version, about = "Stress test RTSP cameras with concurrent sessions")]
struct Cli {
    /// RTSP URLs to open.
    urls: Vec<String>,

    /// File with one URL per line; blank lines and `#` comments are skipped.
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Sessions to open per URL.
    #[arg(short = 'n', long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    replicas: u32,

    /// RTP delivery: tcp (interleaved) or udp.
    #[arg(short, long, default_value = "tcp")]
    transport: Transport,

    /// Stop after this many seconds. Runs until Ctrl-C otherwise.
    #[arg(short, long, value_parser = parse_duration)]
    duration: Option<Duration>,

    /// Write the final view as JSON.
    #[arg(long)]
    export: Option<PathBuf>,

    /// SQLite database for the final view and periodic history.
    #[arg(long, env = "STREAMSTRESS_DB")]
    db: Option<PathBuf>,

    /// Label stored with the run.
    #[arg(long, default_value = "")]
    label: String,

    /// Write lifecycle events as JSON lines.
    #[arg(long)]
    events: Option<PathBuf>,

    /// Directory for daily rolling log files.
    #[arg(long, env = "STREAMSTRESS_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Seconds allowed for connect, handshake and first frame.
    #[arg(long, value_parser = parse_duration)]
    connect_timeout: Option<Duration>,

    /// Seconds without data before a stream counts as interrupted.
    #[arg(long, value_parser = parse_duration)]
    read_timeout: Option<Duration>,

    /// Loss fraction above which a stream is flagged.
    #[arg(long)]
    loss_warning: Option<f64>,

    /// List the runs stored in --db and exit.
    #[arg(long, requires = "db", group = "query")]
    list_runs: bool,

    /// Print the final view of a stored run and exit.
    #[arg(long, value_name = "RUN", requires = "db", group = "query")]
    show_run: Option<i64>,

    /// Print the recorded history of one worker of a stored run and exit.
    #[arg(long, value_name = "RUN", requires_all = ["db", "worker"], group = "query")]
    history: Option<i64>,

    /// Worker id for --history.
    #[arg(long, value_name = "ID")]
    worker: Option<u32>,

    /// Delete a stored run and exit.
    #[arg(long, value_name = "RUN", requires = "db", group = "query")]
    delete_run: Option<i64>,

    /// Print a view written by --export and exit.
    #[arg(long, value_name = "FILE", group = "query")]
    show_export: Option<PathBuf>,

    /// Do not print the live table.
    #[arg(short, long)]
    quiet: bool,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut settings = Settings::load();
        if let Some(timeout) = self.connect_timeout {
            settings.connect_timeout = timeout;
        }
        if let Some(timeout) = self.read_timeout {
            settings.read_timeout = timeout;
        }
        if let Some(threshold) = self.loss_warning {
            settings.loss_warning_threshold = threshold;
        }
        settings
    }

    fn targets(&self) -> Result<Vec<StreamTarget>, Box<dyn std::error::Error + Send + Sync>> {
        let mut addresses = self.urls.clone();
        if let Some(path) = &self.file {
            addresses.extend(read_targets_file(path)?);
        }
        Ok(addresses
            .iter()
            .flat_map(|a| StreamTarget::replicas(a, self.transport, self.replicas))
            .collect())
    }
}

/// Seconds as a finite, non-negative duration.
fn parse_duration(text: &str) -> Result<Duration, String> {
    let secs: f64 = text
        .trim()
        .parse()
        .map_err(|_| format!("`{}` is not a number of seconds", text))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| format!("`{}` must be a finite, non-negative number of seconds", text))
}

/// Answer an offline query against stored results. `None` when the
/// command line asks for a live run instead.
fn run_query(cli: &Cli) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
    if let Some(path) = &cli.show_export {
        return Ok(Some(report::render_table(&report::import_json(path)?)));
    }

    let Some(db) = &cli.db else {
        return Ok(None);
    };
    if cli.list_runs {
        let store = Store::new(db)?;
        return Ok(Some(report::render_runs(&store.list_runs()?)));
    }
    if let Some(run_id) = cli.show_run {
        let store = Store::new(db)?;
        return Ok(Some(report::render_table(&store.load_view(run_id)?)));
    }
    if let (Some(run_id), Some(worker)) = (cli.history, cli.worker) {
        let store = Store::new(db)?;
        return Ok(Some(report::render_history(&store.get_history(run_id, TargetId(worker))?)));
    }
    if let Some(run_id) = cli.delete_run {
        let store = Store::new(db)?;
        store.delete_run(run_id)?;
        return Ok(Some(format!("deleted run {}\n", run_id)));
    }
    Ok(None)
}

fn read_targets_file(path: &Path) -> std::io::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_targets(&text))
}

fn parse_targets(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Where finished runs and history go.
struct Recorder {
    store: Arc<Store>,
    run_id: i64,
    tx: mpsc::Sender<HistoryRow>,
    writer: JoinHandle<()>,
}

impl Recorder {
    fn open(path: &Path, label: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let store = Arc::new(Store::new(path)?);
        let run_id = store.begin_run(label, chrono::Utc::now())?;
        let (tx, rx) = mpsc::channel(1000);
        let writer = tokio::spawn(run_history_writer(rx, store.clone()));
        tracing::info!("Database: recording run {} to {}", run_id, path.display());
        Ok(Self {
            store,
            run_id,
            tx,
            writer,
        })
    }

    fn record(&self, view: &AggregateView) {
        for row in &view.rows {
            if self
                .tx
                .try_send(HistoryRow::from_snapshot(self.run_id, &row.snapshot))
                .is_err()
            {
                tracing::warn!("Database: history writer is behind, dropping rows");
                break;
            }
        }
    }

    async fn finish(self, view: &AggregateView) {
        drop(self.tx);
        if let Err(e) = self.writer.await {
            tracing::error!("Database: history writer failed: {}", e);
        }
        match self.store.save_view(self.run_id, view) {
            Ok(()) => tracing::info!("Database: saved run {}", self.run_id),
            Err(e) => tracing::error!("Database: failed to save run {}: {}", self.run_id, e),
        }
    }
}

/// Append every event to `path` as one JSON object per line.
fn spawn_event_writer(path: PathBuf, mut rx: broadcast::Receiver<EventRecord>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut file = match tokio::fs::File::create(&path).await {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("Events: cannot create {}: {}", path.display(), e);
                return;
            }
        };

        loop {
            match rx.recv().await {
                Ok(record) => {
                    let mut line = match serde_json::to_string(&record) {
                        Ok(l) => l,
                        Err(e) => {
                            tracing::error!("Events: encode failed: {}", e);
                            continue;
                        }
                    };
                    line.push('\n');
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        tracing::error!("Events: write failed: {}", e);
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Events: writer lagged, {} events skipped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        if let Err(e) = file.flush().await {
            tracing::error!("Events: flush failed: {}", e);
        }
    })
}

/// Validate the run and open its recorder, then start the monitor. Nothing
/// fails once sessions are opening.
fn start_run(cli: &Cli) -> Result<(Monitor, Option<Recorder>), Box<dyn std::error::Error + Send + Sync>> {
    let settings = cli.settings();
    let targets = cli.targets()?;
    settings.validate()?;
    validate_targets(&targets)?;

    let recorder = match &cli.db {
        Some(path) => Some(Recorder::open(path, &cli.label)?),
        None => None,
    };

    let connector = Arc::new(RtspConnector::new(&settings));
    tracing::info!("Starting streamstress with {} sessions...", targets.len());
    let monitor = Monitor::start(settings, targets, connector)?;
    Ok((monitor, recorder))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.verbose, cli.log_dir.as_deref())?;

    if let Some(text) = run_query(&cli)? {
        print!("{}", text);
        return Ok(());
    }

    let (mut monitor, recorder) = start_run(&cli)?;
    let refresh_interval = monitor.settings().refresh_interval;

    let event_writer = cli
        .events
        .clone()
        .map(|path| spawn_event_writer(path, monitor.subscribe_events()));

    let deadline = async {
        match cli.duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut ticker = tokio::time::interval(refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, stopping");
                break;
            }
            _ = &mut deadline => {
                tracing::info!("Duration reached, stopping");
                break;
            }
            _ = ticker.tick() => {
                let view = monitor.refresh();
                if !cli.quiet {
                    print!("\x1b[2J\x1b[H{}", report::render_table(&view));
                }
                if let Some(recorder) = &recorder {
                    recorder.record(&view);
                }
            }
        }
    }

    let view = monitor.stop().await;
    println!("{}", report::render_table(&view));

    if let Some(recorder) = recorder {
        recorder.finish(&view).await;
    }
    if let Some(writer) = event_writer {
        let _ = writer.await;
    }
    if let Some(path) = &cli.export {
        report::export_json(&view, path)?;
        tracing::info!("Exported final view to {}", path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_targets_skips_comments() {
        let text = "# cameras\nrtsp://a/1\n\n   rtsp://b/2  \n#rtsp://c/3\n";
        assert_eq!(parse_targets(text), vec!["rtsp://a/1", "rtsp://b/2"]);
    }

    #[test]
    fn test_cli_builds_replicas() {
        let cli = Cli::try_parse_from(["streamstress", "-n", "3", "-t", "udp", "rtsp://a/1", "rtsp://b/1"]).unwrap();
        let targets = cli.targets().unwrap();
        assert_eq!(targets.len(), 6);
        assert!(targets.iter().all(|t| t.transport == Transport::Udp));
        assert_eq!(targets[5].replica_index, 2);
        assert_eq!(targets[5].address, "rtsp://b/1");
    }

    #[test]
    fn test_cli_rejects_zero_replicas() {
        assert!(Cli::try_parse_from(["streamstress", "-n", "0", "rtsp://a/1"]).is_err());
    }

    #[test]
    fn test_cli_overrides_settings() {
        let cli = Cli::try_parse_from([
            "streamstress",
            "--connect-timeout",
            "2.5",
            "--loss-warning",
            "0.2",
            "rtsp://a/1",
        ])
        .unwrap();
        let settings = cli.settings();
        assert_eq!(settings.connect_timeout, Duration::from_millis(2500));
        assert_eq!(settings.loss_warning_threshold, 0.2);
    }

    #[test]
    fn test_cli_checks_duration() {
        let cli = Cli::try_parse_from(["streamstress", "-d", "1.5", "rtsp://a/1"]).unwrap();
        assert_eq!(cli.duration, Some(Duration::from_millis(1500)));

        for bad in ["-3", "NaN", "inf", "soon"] {
            assert!(
                Cli::try_parse_from(["streamstress", "--duration", bad, "rtsp://a/1"]).is_err(),
                "{} accepted",
                bad
            );
        }
    }

    #[test]
    fn test_queries_need_db() {
        assert!(Cli::try_parse_from(["streamstress", "--list-runs"]).is_err());
        assert!(Cli::try_parse_from(["streamstress", "--db", "x.db", "--history", "1"]).is_err());
        assert!(Cli::try_parse_from(["streamstress", "--db", "x.db", "--list-runs", "--show-run", "1"]).is_err());

        let live = Cli::try_parse_from(["streamstress", "--db", "x.db", "rtsp://a/1"]).unwrap();
        assert!(run_query(&live).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queries_read_stored_runs() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("runs.db");
        let db_arg = db.to_str().unwrap();

        let cli = Cli::try_parse_from([
            "streamstress",
            "--db",
            db_arg,
            "--label",
            "lobby",
            "--connect-timeout",
            "0.5",
            "rtsp://127.0.0.1:1/x",
        ])
        .unwrap();
        let (monitor, recorder) = start_run(&cli).unwrap();
        let view = monitor.stop().await;
        recorder.unwrap().finish(&view).await;

        let query = |args: &[&str]| {
            let mut argv = vec!["streamstress", "--db", db_arg];
            argv.extend_from_slice(args);
            run_query(&Cli::try_parse_from(argv).unwrap())
        };

        let runs = query(&["--list-runs"]).unwrap().unwrap();
        assert!(runs.lines().nth(1).unwrap().ends_with("lobby"), "{}", runs);

        let shown = query(&["--show-run", "1"]).unwrap().unwrap();
        assert!(shown.contains("rtsp://127.0.0.1:1/x"));
        assert!(query(&["--show-run", "7"]).is_err());

        assert!(query(&["--history", "1", "--worker", "1"]).unwrap().unwrap().starts_with("TIME"));

        let export = dir.path().join("view.json");
        report::export_json(&view, &export).unwrap();
        let cli = Cli::try_parse_from(["streamstress", "--show-export", export.to_str().unwrap()]).unwrap();
        assert!(run_query(&cli).unwrap().unwrap().contains("1 workers"));

        query(&["--delete-run", "1"]).unwrap();
        assert_eq!(query(&["--list-runs"]).unwrap().unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_nothing_starts_when_setup_fails() {
        let dir = tempfile::tempdir().unwrap();

        // Database that cannot be opened
        let unopenable = dir.path().join("missing").join("runs.db");
        let cli = Cli::try_parse_from(["streamstress", "--db", unopenable.to_str().unwrap(), "rtsp://127.0.0.1:1/x"])
            .unwrap();
        assert!(start_run(&cli).is_err());

        // Bad target: rejected before a run is recorded
        let db = dir.path().join("runs.db");
        let cli = Cli::try_parse_from(["streamstress", "--db", db.to_str().unwrap(), "http://cam/1"]).unwrap();
        assert!(start_run(&cli).is_err());
        assert!(Store::new(&db).unwrap().list_runs().unwrap().is_empty());
    }
}
