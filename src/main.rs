use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use avatar_relay::config::Config;
use avatar_relay::runtime::{Command, Runtime};
use avatar_relay::stream::TestPattern;

const CONFIG_PATH: &str = "config.toml";

/// logs/relay_YYYYmmdd_HHMMSS.log
fn open_log_file() -> Result<(File, PathBuf)> {
    fs::create_dir_all("logs").context("failed to create logs/")?;
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = PathBuf::from(format!("logs/relay_{}.log", ts));
    let file = File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    Ok((file, path))
}

fn init_logging() -> Result<PathBuf> {
    let (file, path) = open_log_file()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .try_init()
        .context("failed to install log subscriber")?;
    Ok(path)
}

/// 標準入力: c=キャリブレーション, s=保存, r=再接続, q=終了
fn spawn_console(tx: mpsc::UnboundedSender<Command>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match Command::parse(&line) {
                Some(command) => {
                    if tx.send(command).is_err() || command == Command::Quit {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => tracing::info!("console: unknown command {:?} (c/s/r/q)", line.trim()),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_path = init_logging()?;
    tracing::info!("avatar-relay {}", env!("GIT_VERSION"));
    tracing::info!("log file: {}", log_path.display());

    let config = Config::load_or_default(CONFIG_PATH);
    tracing::info!(
        "stream: {}x{} @ {}fps, quality {}, gzip {}, push {}",
        config.stream.width,
        config.stream.height,
        config.stream.target_fps,
        config.stream.jpeg_quality,
        config.stream.gzip,
        config.stream.push_url
    );
    tracing::info!("landmarks: {}", config.landmarks.listen_addr);

    let mut runtime = Runtime::new(config, Box::new(TestPattern::default()));
    if let Some(addr) = runtime.pull_addr() {
        tracing::info!("pull server: http://{}/stream", addr);
    }

    // kill -USR1 <pid> でキャリブレーション
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, runtime.calibrate_flag())?;

    let (tx, rx) = mpsc::unbounded_channel();
    spawn_console(tx.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(Command::Quit);
        }
    });

    tracing::info!("commands: [c] calibrate  [s] store calibration  [r] reconnect  [q] quit");
    runtime.run(rx).await
}
