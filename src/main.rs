//! Shardvault Network Simulator
//!
//! This binary boots an in-memory storage network and walks one file through
//! its whole life:
//! - Peer registration and reputation-ranked placement
//! - Fault injection (silent peers, silently corrupted shards)
//! - Audit rounds with proof checking and automatic repair
//! - Retrieval from the surviving shards
//!
//! Run with: cargo run --release
//! With faults: cargo run --release -- --offline 2 --corrupt 2 --audit-rounds 3

use clap::{ArgAction, Parser};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use shardvault::{
    api::{EngineContext, StorageEngine},
    clock::ManualClock,
    config::{self, EngineConfig},
    integrity,
    metrics::format_size,
    peer::{MemoryNetwork, PeerHandle},
    registry::{InMemoryRegistry, PeerId, PeerRegistry},
    Result, VaultError,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for the network simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of storage peers to start
    #[arg(long, default_value_t = 12)]
    peers: usize,

    /// Shards needed to reconstruct the file (k)
    #[arg(long, default_value_t = 4)]
    required: usize,

    /// Shards produced for the file (n)
    #[arg(long, default_value_t = 8)]
    total: usize,

    /// Size of the random test file in bytes
    #[arg(long, default_value_t = 256 * 1024)]
    file_size: usize,

    /// Storage capacity of each peer in bytes
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    capacity: u64,

    /// Number of shard holders to take offline after upload
    #[arg(long, default_value_t = 1)]
    offline: usize,

    /// Number of shard holders whose shard is silently corrupted
    #[arg(long, default_value_t = 1)]
    corrupt: usize,

    /// Audit rounds to run before downloading
    #[arg(long, default_value_t = 5)]
    audit_rounds: usize,

    /// Password used to encrypt the file
    #[arg(long, default_value = "correct horse battery staple")]
    password: String,

    /// Increase output verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    init_tracing(cli.verbose);

    if cli.offline + cli.corrupt > cli.total.saturating_sub(cli.required) {
        warn!(
            "{} faulty holders exceed the {} shards of redundancy; download may fail",
            cli.offline + cli.corrupt,
            cli.total.saturating_sub(cli.required)
        );
    }

    info!("");
    info!("╔══════════════════════════════════════════════════════════════╗");
    info!("║   Shardvault Network Simulator                               ║");
    info!("║   Encrypted, Erasure-Coded Storage with Audits and Repair    ║");
    info!("╚══════════════════════════════════════════════════════════════╝");
    info!("");

    if let Err(e) = simulate(&cli).await {
        error!("Simulation failed: {}", e);
        std::process::exit(1);
    }
}

async fn simulate(cli: &Cli) -> Result<()> {
    let engine_config = EngineConfig {
        required_shards: cli.required,
        total_shards: cli.total,
        // Simulated peers answer instantly; keep timeouts short
        transfer_timeout_ms: 500,
        audit_timeout_ms: 500,
        retry_backoff_ms: 10,
        retrieval_retry_delay_ms: 50,
        // Audit interval is in virtual seconds driven by the manual clock
        audit_interval_secs: config::DEFAULT_AUDIT_INTERVAL_SECS,
        unreachable_tolerance: 1,
        ..Default::default()
    };

    // Phase 1: Network Setup
    info!("[1/5] Network Setup");
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let registry = Arc::new(InMemoryRegistry::with_heartbeat_timeout(
        clock.clone(),
        engine_config.heartbeat_timeout_secs,
    ));
    let network = Arc::new(MemoryNetwork::new());
    let peers = setup_network(&network, registry.as_ref(), cli.peers, cli.capacity).await?;
    info!("  ✓ {} peers registered", peers.len());
    info!("");

    let engine = StorageEngine::new(EngineContext::new(
        registry.clone(),
        network.clone(),
        clock.clone(),
        engine_config,
    ))?;

    // Phase 2: Upload
    info!("[2/5] Upload");
    let mut rng = StdRng::seed_from_u64(config::TEST_RANDOM_SEED);
    let mut data = vec![0u8; cli.file_size];
    rng.fill_bytes(&mut data);

    let start = Instant::now();
    let file_id = engine.upload(&data, &cli.password).await?;
    let manifest = engine.manifest(&file_id).await?;
    info!(
        "  ✓ Uploaded {} as {} in {:.1?}",
        format_size(data.len() as u64),
        file_id.short(),
        start.elapsed()
    );
    info!(
        "  ✓ {} shards of {} (k={}, n={}, redundancy {:.2}x)",
        manifest.total_shards,
        format_size(manifest.shard_size),
        manifest.required_shards,
        manifest.total_shards,
        manifest.redundancy_factor()
    );
    let placed_digest = integrity::manifest_digest(&manifest)?;
    info!("  ✓ Manifest digest {}", placed_digest.short());
    info!("");

    // Phase 3: Fault Injection
    info!("[3/5] Fault Injection");
    let mut offline = HashSet::new();
    let holders: Vec<_> = manifest.shards.iter().collect();
    for descriptor in holders.iter().take(cli.offline) {
        if let Some(handle) = network.handle_for(&descriptor.assigned_peer_id) {
            handle.set_offline(true).await?;
            offline.insert(descriptor.assigned_peer_id);
            info!(
                "  • shard {} holder {} is now offline",
                descriptor.shard_index,
                descriptor.assigned_peer_id.short()
            );
        }
    }
    for descriptor in holders.iter().skip(cli.offline).take(cli.corrupt) {
        if let Some(handle) = network.handle_for(&descriptor.assigned_peer_id) {
            handle.corrupt_shard(file_id, descriptor.shard_index).await?;
            info!(
                "  • shard {} on {} silently corrupted",
                descriptor.shard_index,
                descriptor.assigned_peer_id.short()
            );
        }
    }
    info!("");

    // Phase 4: Audits
    info!("[4/5] Audit Rounds");
    for round in 1..=cli.audit_rounds {
        let now = clock.advance(engine.context().config.audit_interval_secs);
        heartbeat(&peers, &offline, registry.as_ref()).await?;
        let report = engine.audit().tick(now).await;
        info!(
            "  Round {}: {} challenged, {} verified, {} failed, {} unreachable, {} repaired",
            round,
            report.challenged,
            report.verified,
            report.failed,
            report.unreachable,
            report.repaired.len()
        );
    }
    let current = engine.manifest(&file_id).await?;
    let current_digest = integrity::manifest_digest(&current)?;
    if current_digest != placed_digest {
        let moved = current
            .shards
            .iter()
            .filter(|d| d.assignment_version > 0)
            .count();
        info!(
            "  ✓ Manifest digest {} -> {} ({} shard(s) re-placed)",
            placed_digest.short(),
            current_digest.short(),
            moved
        );
    } else {
        info!("  ✓ Manifest unchanged ({})", current_digest.short());
    }
    info!("");

    // Phase 5: Download
    info!("[5/5] Download");
    let start = Instant::now();
    match engine.download(&file_id, &cli.password).await {
        Ok(bytes) if bytes == data => {
            info!("  ✓ Downloaded and verified {} in {:.1?}", format_size(bytes.len() as u64), start.elapsed());
        }
        Ok(_) => {
            return Err(VaultError::InvalidInput(
                "downloaded bytes differ from the original".to_string(),
            ))
        }
        Err(e) => return Err(e),
    }
    info!("");

    info!("  Metrics:");
    info!("{}", engine.context().metrics.snapshot().format_table());

    info!("  Peer Reputation:");
    for peer in registry.all_peers() {
        info!(
            "    • {} score {:.3} ({:?})",
            peer.peer_id.short(),
            peer.reputation_score,
            peer.status
        );
    }
    Ok(())
}

async fn setup_network(
    network: &MemoryNetwork,
    registry: &dyn PeerRegistry,
    count: usize,
    capacity: u64,
) -> Result<Vec<PeerHandle>> {
    async {
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let (_, handle) = network
                .spawn_peer(registry, format!("mem://peer-{i:02}"), capacity)
                .await?;
            handles.push(handle);
        }
        Ok(handles)
    }
    .instrument(info_span!("network_setup"))
    .await
}

/// Reachable peers report in with their free space.
async fn heartbeat(
    peers: &[PeerHandle],
    offline: &HashSet<PeerId>,
    registry: &dyn PeerRegistry,
) -> Result<()> {
    for handle in peers.iter().filter(|h| !offline.contains(&h.peer_id())) {
        let stats = handle.stats().await?;
        registry
            .heartbeat(&handle.peer_id(), stats.capacity_bytes.saturating_sub(stats.used_bytes))
            .await?;
    }
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info,shardvault=info",
        1 => "debug,shardvault=debug",
        _ => "shardvault=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    use tracing_tree::HierarchicalLayer;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            HierarchicalLayer::new(2)
                .with_targets(false)
                .with_bracketed_fields(true),
        )
        .init();
}
