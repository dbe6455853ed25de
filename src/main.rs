use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use rand::RngCore;
use schnorr_fun::{frost::Frost, nonce::Deterministic};
use sha2::Sha256;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keygen_ceremony::{
    config::Config,
    gossip::MemoryNetwork,
    notify::{HttpNotifier, LogNotifier, Notifier},
    peers::PeerId,
    storage::FileStore,
    Coordinator, KeygenRequest,
};

/// Run a keygen ceremony between in-process peers.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of peers taking part
    #[arg(long, default_value_t = 3)]
    peers: usize,

    /// Number of shares needed to use the key
    #[arg(long, default_value_t = 2)]
    threshold: usize,

    /// Overrides `home_address` from the configuration
    #[arg(long)]
    home: Option<PathBuf>,

    /// Where each peer POSTs its result. Results are only logged without one.
    #[arg(long)]
    callback_url: Option<String>,
}

fn random_peer_id(rng: &mut impl RngCore) -> PeerId {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    // a leading zero byte would not survive as a share index
    bytes[0] |= 1;
    PeerId::new(bs58::encode(bytes).into_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(home) = args.home {
        config.home_address = home;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut rng = rand::thread_rng();
    let peer_ids: Vec<PeerId> = (0..args.peers).map(|_| random_peer_id(&mut rng)).collect();
    let network = MemoryNetwork::new(config.inbound_capacity);
    let frost = Arc::new(Frost::<Sha256, Deterministic<Sha256>>::default());
    let notifier: Arc<dyn Notifier> = match &args.callback_url {
        Some(_) => Arc::new(HttpNotifier::new(
            reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
        )),
        None => Arc::new(LogNotifier),
    };

    let mut coordinators = vec![];
    for peer in &peer_ids {
        let transport = Arc::new(network.endpoint(peer.clone()));
        let store = Arc::new(FileStore::new(config.home_address.join(peer.as_str())));
        let coordinator =
            Coordinator::new(frost.clone(), transport, store.clone(), notifier.clone())
                .with_timeout(config.ceremony_timeout());

        if let Some(record) = coordinator.stored_key().await? {
            info!(
                peer = %record.peer_id,
                home = %store.root().display(),
                "found key from an earlier ceremony"
            );
        }
        coordinators.push(coordinator);
    }

    let handles: Vec<_> = coordinators
        .into_iter()
        .map(|coordinator| {
            let request = KeygenRequest {
                peer_ids: peer_ids.clone(),
                threshold: args.threshold,
                peers_count: args.peers,
                callback_url: args.callback_url.clone().unwrap_or_default(),
            };
            tokio::spawn(async move { coordinator.keygen(request).await })
        })
        .collect();

    let mut public_keys = vec![];
    for handle in handles {
        let result = handle.await??;
        public_keys.push(result.public_key);
    }

    public_keys.dedup();
    match public_keys.as_slice() {
        [public_key] => info!(%public_key, "all peers agree on the joint public key"),
        _ => warn!(?public_keys, "peers disagree on the joint public key"),
    }
    Ok(())
}
