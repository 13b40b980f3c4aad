//! The `napt-router` binary: load the configuration, open the packet
//! sockets, then run one receive thread per interface plus the two
//! background workers until SIGINT.

use anyhow::{Context as _, Result};
use clap::Parser;
use napt_router::arp_cache::ArpCache;
use napt_router::config::{self, Timeouts};
use napt_router::nat::NatTable;
use napt_router::pipeline::Pipeline;
use napt_router::transport::{PacketSockets, Transport};
use napt_router::worker;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// A software IPv4 router with an integrated NAPT engine.
#[derive(Parser)]
struct Args {
    /// Interface and routing-table configuration (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Rewrite traffic between the internal interface and the external ones.
    #[arg(long)]
    nat: bool,

    /// Idle seconds before an ICMP mapping is reaped.
    #[arg(long, default_value_t = 60)]
    icmp_timeout: u64,

    /// Idle seconds before an established TCP connection is reaped.
    #[arg(long, default_value_t = 7440)]
    tcp_idle: u64,

    /// Idle seconds before a TCP connection outside ESTABLISHED is reaped.
    #[arg(long, default_value_t = 300)]
    transitory_idle: u64,
}

static SIGINT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    SIGINT.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let timeouts = Timeouts {
        icmp: Duration::from_secs(args.icmp_timeout),
        tcp_idle: Duration::from_secs(args.tcp_idle),
        transitory_idle: Duration::from_secs(args.transitory_idle),
    };

    let config = Arc::new(config::load(&args.config, args.nat, timeouts)?);
    let arp = Arc::new(ArpCache::new());
    let nat = Arc::new(NatTable::new(timeouts));
    let sockets = Arc::new(PacketSockets::open(&config.interfaces)?);
    let transport: Arc<dyn Transport> = sockets.clone();
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&config),
        Arc::clone(&arp),
        Arc::clone(&nat),
    ));
    let shutdown = Arc::new(AtomicBool::new(false));

    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }

    tracing::info!(
        nat = config.nat_enabled,
        interfaces = config.interfaces.len(),
        "Router starting"
    );

    let mut handles = Vec::new();

    handles.push(worker::spawn_arp_worker(
        Arc::clone(&arp),
        Arc::clone(&config),
        Arc::clone(&transport),
        Arc::clone(&shutdown),
    )?);
    handles.push(worker::spawn_nat_reaper(
        Arc::clone(&nat),
        Arc::clone(&config),
        Arc::clone(&transport),
        Arc::clone(&shutdown),
    )?);

    for iface in &config.interfaces {
        let name = iface.name.clone();
        let thread_name = name.clone();
        let sockets = Arc::clone(&sockets);
        let pipeline = Arc::clone(&pipeline);
        let transport = Arc::clone(&transport);
        let shutdown = Arc::clone(&shutdown);

        handles.push(
            std::thread::Builder::new()
                .name(format!("rx-{name}"))
                .spawn(move || rx_loop(&name, &sockets, &pipeline, transport.as_ref(), &shutdown))
                .with_context(|| format!("Failed to spawn receive thread for `{thread_name}`"))?,
        );
    }

    while !SIGINT.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("Shutting down");
    shutdown.store(true, Ordering::Relaxed);

    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

fn rx_loop(
    iface: &str,
    sockets: &PacketSockets,
    pipeline: &Pipeline,
    transport: &dyn Transport,
    shutdown: &AtomicBool,
) {
    // Oversized frames must arrive untruncated so admission can reject
    // them, hence a buffer above the MTU.
    let mut buf = vec![0u8; eth_frame::MTU + 512];

    while !shutdown.load(Ordering::Relaxed) {
        let n = match sockets.recv(iface, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                if !is_timeout(&e) {
                    tracing::warn!(%iface, "Receive failed: {e:#}");
                    std::thread::sleep(Duration::from_millis(100));
                }

                continue;
            }
        };

        for transmit in pipeline.handle_frame(buf[..n].to_vec(), iface, Instant::now()) {
            if let Err(e) = transport.send(&transmit.iface, transmit.frame.as_bytes()) {
                tracing::warn!(iface = %transmit.iface, "Failed to transmit: {e:#}");
            }
        }
    }

    tracing::debug!(%iface, "Receive loop stopped");
}

fn is_timeout(e: &anyhow::Error) -> bool {
    e.downcast_ref::<std::io::Error>().is_some_and(|io| {
        matches!(
            io.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        )
    })
}
