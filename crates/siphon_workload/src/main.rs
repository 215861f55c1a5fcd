//! Workload driver: streams generated entries through an in-process
//! cluster and reports throughput.
//!
//! Node tasks apply the receiver semantics against plain in-memory maps, so
//! the run exercises the full streamer path (routing, batching, permits,
//! acknowledgments) without any network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use siphon::{ClusterServices, Streamer, StreamerConfig};
use siphon_cluster::{
    ChannelTransport, Entry, InboundRequest, JsonCodec, NodeId, StaticTopology, StreamReceiver,
    StreamResponse, WireCodec,
};

#[derive(Parser, Debug)]
#[command(name = "siphon-workload", about = "Stream entries through an in-process cluster")]
struct Args {
    /// Number of server nodes in the simulated cluster.
    #[arg(long, default_value_t = 3)]
    nodes: usize,
    /// Owners per key, primary included.
    #[arg(long, default_value_t = 2)]
    replication: usize,
    /// Total entries to stream.
    #[arg(long, default_value_t = 100_000)]
    entries: usize,
    /// Distinct keys in the generated keyspace.
    #[arg(long, default_value_t = 10_000)]
    keys: usize,
    /// Value payload size in bytes.
    #[arg(long, default_value_t = 64)]
    value_size: usize,
    /// Entries buffered per destination before a batch is submitted.
    #[arg(long, default_value_t = 512)]
    buf_size: usize,
    /// In-flight batches allowed per destination.
    #[arg(long, default_value_t = 8)]
    parallel_ops: usize,
    /// Use the overwriting per-entry receiver instead of the isolated one.
    #[arg(long)]
    overwrite: bool,
    /// RNG seed; zero picks a random one.
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

/// One simulated server node applying batches against an in-memory map.
struct ServerNode {
    store: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl ServerNode {
    fn spawn(
        node: NodeId,
        transport: Arc<ChannelTransport>,
        mut inbound: mpsc::UnboundedReceiver<InboundRequest>,
    ) -> Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>> {
        let server = ServerNode {
            store: Arc::new(Mutex::new(HashMap::new())),
        };
        let store = server.store.clone();
        let codec = JsonCodec::new();
        tokio::spawn(async move {
            while let Some(req) = inbound.recv().await {
                let receiver = codec
                    .decode_receiver(&req.request.receiver)
                    .unwrap_or(StreamReceiver::Isolated);
                server.apply(&receiver, req.request.entries);
                let topic = req.request.response_topic.clone();
                transport.respond(&topic, node, StreamResponse::ok(req.request.request_id));
            }
        });
        store
    }

    fn apply(&self, receiver: &StreamReceiver, entries: Vec<Entry>) {
        let mut store = self.store.lock().unwrap();
        for entry in entries {
            match entry.value {
                None => {
                    store.remove(&entry.key);
                }
                Some(value) => {
                    if receiver.overwrites() {
                        store.insert(entry.key, value);
                    } else {
                        store.entry(entry.key).or_insert(value);
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.nodes > 0, "--nodes must be > 0");
    anyhow::ensure!(args.keys > 0, "--keys must be > 0");
    anyhow::ensure!(args.value_size > 0, "--value-size must be > 0");

    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let mut rng = StdRng::seed_from_u64(seed);

    // Client id lives outside the member range.
    let client: NodeId = 0;
    let members: Vec<NodeId> = (1..=args.nodes as NodeId).collect();
    let topology = Arc::new(StaticTopology::new(
        client,
        members.clone(),
        args.replication,
    ));
    let transport = ChannelTransport::new(client);

    let mut stores = Vec::with_capacity(members.len());
    for &node in &members {
        let inbound = transport.register_node(node);
        stores.push(ServerNode::spawn(node, transport.clone(), inbound));
    }

    let config = StreamerConfig::new("workload")
        .buf_size(args.buf_size)
        .parallel_ops(args.parallel_ops)
        .receiver(if args.overwrite {
            StreamReceiver::Individual
        } else {
            StreamReceiver::Isolated
        });
    let streamer = Streamer::new(
        config,
        ClusterServices::new(topology, transport, Arc::new(JsonCodec::new())),
    )
    .context("failed to build streamer")?;

    tracing::info!(
        nodes = args.nodes,
        replication = args.replication,
        entries = args.entries,
        seed,
        "starting workload"
    );

    let start = Instant::now();
    let mut last_fut = None;
    for i in 0..args.entries {
        let key = format!("k{}", rng.gen_range(0..args.keys)).into_bytes();
        let mut value = vec![0u8; args.value_size];
        value[..8.min(args.value_size)]
            .copy_from_slice(&(i as u64).to_be_bytes()[..8.min(args.value_size)]);
        last_fut = Some(streamer.add(key, value).await?);
    }
    streamer.flush().await?;
    if let Some(fut) = last_fut {
        fut.wait().await?;
    }
    let elapsed = start.elapsed().max(Duration::from_millis(1));

    let stats = streamer.stats();
    let stored: usize = stores.iter().map(|s| s.lock().unwrap().len()).sum();
    tracing::info!(
        elapsed_ms = elapsed.as_millis() as u64,
        entries_per_sec = (args.entries as f64 / elapsed.as_secs_f64()) as u64,
        batches = stats.batches_submitted,
        acked = stats.batches_acked,
        remaps = stats.remaps,
        stored_rows = stored,
        "workload finished"
    );

    streamer.close(false).await?;
    Ok(())
}
