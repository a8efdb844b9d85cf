//! Client which fetches game assets, then joins a game-sync session and logs
//! everything the server sends.
//!
//! ```sh
//! cargo run -p sync_client -- --url wss://connect.example/2kki --fetch System/Window.png
//! ```

use {
    anyhow::{Context, Result},
    clap::Parser,
    core::{cell::Cell, time::Duration},
    rpgsync_fetch::{
        FetchRuntime, FetchService,
        config::{AssetSource, FetchConfig},
        request::RequestBinding,
    },
    rpgsync_io::{
        connection::{Connection, ConnectionConfig},
        dispatch::SystemMessage,
        packet::NamedPacket,
    },
    rpgsync_websocket::{ClientConfig, Security, WebSocketRuntime, WebSocketTransport},
    std::{path::PathBuf, rc::Rc, thread, time::Instant},
    tracing::{debug, info, warn},
    tracing_subscriber::EnvFilter,
};

/// `rpgsync` demo client
#[derive(Debug, Parser)]
struct Args {
    /// Session server to connect to
    #[arg(long)]
    url: String,
    /// Game whose assets are fetched
    #[arg(long, default_value = "2kki")]
    game: String,
    /// Directory which fetched assets are cached in
    #[arg(long, default_value = "cache")]
    cache: PathBuf,
    /// Asset to fetch, as `Directory/File`; may be repeated
    #[arg(long)]
    fetch: Vec<String>,
    /// Seconds to stay in the session for
    #[arg(long, default_value_t = 30)]
    duration: u64,
    /// Secret which outgoing frames are signed with
    #[arg(long, default_value = "")]
    psk: String,
    /// Accept any server certificate
    #[arg(long)]
    no_cert_validation: bool,
}

const INDEX_FILE: &str = "index.json";
const KEEP_ALIVE: &str = "ka";
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);
const TICK: Duration = Duration::from_millis(16);
const INDEX_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let config = FetchConfig::default()
        .with_source(AssetSource::remote(&args.game))
        .with_cache_root(args.cache.join(&args.game));
    let mut fetch = FetchService::with_http(config, FetchRuntime::default());
    load_index(&mut fetch)?;
    let _bindings = args
        .fetch
        .iter()
        .map(|path| fetch_asset(&mut fetch, path))
        .collect::<Vec<_>>();

    run_session(&args, &mut fetch)
}

fn load_index(fetch: &mut FetchService) -> Result<()> {
    let index = fetch.request_root_file(INDEX_FILE);
    index.set_important_file(true);
    index.start();

    let start = Instant::now();
    while !index.is_ready() {
        if start.elapsed() > INDEX_TIMEOUT {
            anyhow::bail!("timed out fetching {INDEX_FILE}");
        }
        fetch.poll();
        thread::sleep(TICK);
    }

    if index.succeeded() {
        fetch
            .create_request_mapping(INDEX_FILE)
            .with_context(|| format!("failed to load {INDEX_FILE}"))?;
    } else {
        warn!("Could not fetch {INDEX_FILE}, requesting files by their own paths");
    }
    Ok(())
}

fn fetch_asset(fetch: &mut FetchService, path: &str) -> RequestBinding {
    let (directory, file) = path.rsplit_once('/').unwrap_or((".", path));
    let request = fetch.request_file(directory, file);
    request.set_graphic_file(
        [".png", ".bmp", ".xyz"]
            .iter()
            .any(|ext| file.to_lowercase().ends_with(ext)),
    );
    let binding = request.bind(|result| {
        if result.success {
            info!("Fetched {}/{}", result.directory, result.file);
        } else {
            warn!("Failed to fetch {}/{}", result.directory, result.file);
        }
    });
    request.start();
    binding
}

fn client_config(args: &Args) -> ClientConfig {
    let security = if args.url.starts_with("ws://") {
        Security::Plain
    } else if args.no_cert_validation {
        Security::AcceptAnyCert
    } else {
        Security::NativeRoots
    };
    ClientConfig::builder().with_security(security).build()
}

fn run_session(args: &Args, fetch: &mut FetchService) -> Result<()> {
    let transport = WebSocketTransport::new(WebSocketRuntime::default(), client_config(args));
    let mut conn = Connection::new(
        transport,
        ConnectionConfig::default().with_psk(args.psk.as_bytes()),
    );

    let exited = Rc::new(Cell::new(false));
    conn.on_system(SystemMessage::Open, || info!("Session opened"));
    conn.on_system(SystemMessage::Close, || warn!("Session closed"));
    conn.on_system(SystemMessage::Exit, {
        let exited = exited.clone();
        move || {
            info!("Session exited by the server");
            exited.set(true);
        }
    });
    conn.on_raw(|name, params| info!("{name}: {params:?}"));
    conn.open(&args.url);

    let start = Instant::now();
    let duration = Duration::from_secs(args.duration);
    let mut last_keep_alive = Instant::now();
    while !exited.get() && start.elapsed() < duration {
        conn.poll();
        fetch.poll();

        if conn.is_connected() && last_keep_alive.elapsed() >= KEEP_ALIVE_INTERVAL {
            last_keep_alive = Instant::now();
            conn.enqueue(&NamedPacket::new(KEEP_ALIVE))?;
            match conn.flush_queue() {
                Ok(stats) => debug!("Sent {} batches", stats.batches.0),
                Err(err) => warn!("Failed to flush: {err}"),
            }
        }
        thread::sleep(TICK);
    }

    let stats = conn.stats();
    info!(
        "Leaving after {:.1}s, sent {} batches, received {} messages",
        start.elapsed().as_secs_f32(),
        stats.batches_sent.0,
        stats.msgs_recv.0
    );
    conn.close();
    Ok(())
}
