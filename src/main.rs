use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use vsplane::config::{self, Config};
use vsplane::dataplane::{
    spawn_aging_task, Connection, FrameSink, InterfaceInfo, NeighborCache, NeighborEgress,
    NeighborKey, NextHop, Packet, PassThrough, Route, RouteLookup, RoutingTable, TransmitEngine,
    XmitMode, XmitResult,
};
use vsplane::protocol::ipv4::Ipv4Builder;
use vsplane::protocol::MacAddr;
use vsplane::telemetry::{init_logging, Counter, MetricsRegistry};

#[derive(Parser)]
#[command(name = "vsplane")]
#[command(about = "Load balancer data-plane core: neighbor cache and transmit engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Multi-worker Direct Routing forwarding benchmark
    Bench(BenchArgs),
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate a configuration file
    Validate {
        /// Path to vsplane.toml
        #[arg(short, long, default_value = "vsplane.toml")]
        config: PathBuf,
    },
    /// Print the default configuration
    Defaults,
}

#[derive(clap::Args)]
struct BenchArgs {
    /// Optional configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Forwarding worker threads
    #[arg(short, long, default_value_t = 2)]
    workers: usize,

    /// log2 of the number of routes
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u8).range(0..=16))]
    route_bits: u8,

    /// log2 of the number of resolved neighbors
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(0..=16))]
    neighbor_bits: u8,

    /// Run time in seconds
    #[arg(short, long, default_value_t = 5)]
    seconds: u64,

    /// Report interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Validate { config } => {
                init_logging(None);
                cmd_config_validate(&config)
            }
            ConfigAction::Defaults => cmd_config_defaults(),
        },
        Commands::Bench(args) => cmd_bench(args),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("Validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}

fn cmd_config_defaults() -> Result<(), String> {
    let text = config::to_toml(&Config::default()).map_err(|e| e.to_string())?;
    print!("{}", text);
    Ok(())
}

/// Frame sink that only counts
#[derive(Default)]
struct CountingSink {
    frames: Counter,
    bytes: Counter,
}

impl FrameSink for CountingSink {
    fn transmit(&self, _port: u32, frame: Vec<u8>) -> vsplane::Result<()> {
        self.frames.inc();
        self.bytes.add(frame.len() as u64);
        Ok(())
    }
}

const BENCH_PORT: u32 = 1;
const BENCH_LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const BENCH_VIP: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);

fn gateway(n: u32) -> Ipv4Addr {
    Ipv4Addr::new(10, 1, (n >> 8) as u8, n as u8)
}

fn route_prefix(n: u32) -> Ipv4Addr {
    Ipv4Addr::new(20, (n >> 8) as u8, n as u8, 0)
}

type BenchEngine = TransmitEngine<Arc<RoutingTable>, Arc<NeighborEgress<CountingSink>>>;

fn cmd_bench(args: BenchArgs) -> Result<(), String> {
    let mut cfg = match &args.config {
        Some(path) => config::load(path).map_err(|e| format!("Failed to load config: {}", e))?,
        None => Config::default(),
    };
    init_logging(Some(&cfg.logging));

    let routes = 1u32 << args.route_bits;
    let neighbors = 1u32 << args.neighbor_bits;
    cfg.neighbor.max_entries = cfg.neighbor.max_entries.max(neighbors as usize + 1);

    let validation = config::validate(&cfg);
    validation.print_diagnostics();
    if validation.has_errors() {
        return Err("Validation failed".to_string());
    }

    let mut table = RoutingTable::new();
    for n in 0..routes {
        table.add(
            0,
            Route::new(
                route_prefix(n),
                24,
                NextHop::via(gateway(n % neighbors), BENCH_PORT),
            ),
        );
    }
    let table = Arc::new(table);

    let metrics = Arc::new(MetricsRegistry::new());
    let cache = Arc::new(NeighborCache::new(&cfg.neighbor, Arc::clone(&metrics)));
    // With fast xmit off, the engine hands packets over without a next hop
    let egress = Arc::new(
        NeighborEgress::new(Arc::clone(&cache), CountingSink::default())
            .with_fallback_routes(Arc::clone(&table) as Arc<dyn RouteLookup>),
    );
    egress.add_interface(
        BENCH_PORT,
        InterfaceInfo {
            ip_addr: BENCH_LOCAL,
            mac_addr: MacAddr([0x02, 0, 0, 0, 0, 0x01]),
            prefix_len: 8,
            vrf: 0,
        },
    );

    let now = Instant::now();
    for n in 0..neighbors {
        let key = NeighborKey::new(0, gateway(n));
        let mac = MacAddr::from_u64(0x0200_0000_0000 | n as u64);
        cache
            .insert(&key, mac, BENCH_PORT, now)
            .map_err(|e| format!("Failed to add neighbor {}: {}", key, e))?;
    }

    info!(routes, neighbors, workers = args.workers, "Benchmark tables ready");

    let engine: Arc<BenchEngine> = Arc::new(TransmitEngine::new(
        cfg.xmit.clone(),
        table,
        Arc::clone(&egress),
        Arc::clone(&metrics),
    ));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to create runtime: {}", e))?;

    let stop = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = (0..args.workers)
        .map(|id| {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || run_worker(id, &engine, routes, &stop))
        })
        .collect();

    runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let aging = spawn_aging_task(
            Arc::clone(&egress),
            cfg.neighbor.aging_interval(),
            shutdown_rx,
        );

        let period = Duration::from_millis(args.interval_ms.max(1));
        let mut report = tokio::time::interval(period);
        report.tick().await;

        let deadline = Instant::now() + Duration::from_secs(args.seconds);
        let mut last = egress.sink().frames.get();
        let mut last_at = Instant::now();
        while Instant::now() < deadline {
            report.tick().await;
            let frames = egress.sink().frames.get();
            let elapsed = last_at.elapsed().as_secs_f64();
            println!(
                "[INFO] {:>12.0} pps  forwarded={} dropped={}",
                (frames - last) as f64 / elapsed,
                metrics.xmit_forwarded.get(),
                metrics.xmit_dropped()
            );
            last = frames;
            last_at = Instant::now();
        }

        let _ = shutdown_tx.send(true);
        let _ = aging.await;
    });

    stop.store(true, Ordering::Relaxed);
    let mut sent = 0;
    for worker in workers {
        sent += worker
            .join()
            .map_err(|_| "Worker thread panicked".to_string())?;
    }

    println!(
        "[INFO] total sent={} frames={} bytes={}",
        sent,
        egress.sink().frames.get(),
        egress.sink().bytes.get()
    );
    for (name, value) in metrics.export() {
        debug!(name = %name, value, "metric");
    }
    Ok(())
}

/// One forwarding worker: one connection per route, packets sent round
/// robin over them in Direct Routing mode.
fn run_worker(id: usize, engine: &BenchEngine, routes: u32, stop: &AtomicBool) -> u64 {
    let conns: Vec<(Connection, Packet)> = (0..routes)
        .filter_map(|n| {
            let real = Ipv4Addr::from(u32::from(route_prefix(n)) | 1);
            let client = Ipv4Addr::new(203, 0, (id >> 8) as u8, id as u8);
            let conn = Connection::new(
                (client, 40_000 + n as u16),
                (BENCH_VIP, 80),
                (BENCH_LOCAL, 0),
                (real, 80),
            );
            let data = Ipv4Builder::new()
                .src_addr(client)
                .dst_addr(BENCH_VIP)
                .udp(40_000 + n as u16, 80, &[0u8; 18])
                .build();
            Packet::new(data, 0).ok().map(|pkt| (conn, pkt))
        })
        .collect();

    let mut sent = 0u64;
    'outer: loop {
        for (conn, packet) in &conns {
            if stop.load(Ordering::Relaxed) {
                break 'outer;
            }
            let result = engine.transmit(packet.clone(), conn, &PassThrough, XmitMode::DirectRouting);
            if result == XmitResult::Forwarded {
                sent += 1;
            }
        }
    }

    debug!(worker = id, sent, "Worker finished");
    sent
}
