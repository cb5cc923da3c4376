use std::sync::{Arc, Mutex};
use std::time::Duration;

use vpn_core::{
    AssetId, BlockHash, ChainPosition, ClientDatum, PricePlan, ReferenceDatum, ScriptAddress,
    TxHash,
};
use vpn_indexer::provision::ProvisionFuture;
use vpn_indexer::{
    AssetEntry, ChainEvent, ChainSource, ChannelSource, ClientProvisioner, Indexer, IndexerError,
    IndexerMetrics, IndexerSettings, SyncStatus, TransactionEvent, TxOutput,
};
use vpn_state::StateStore;

const SCRIPT: &str = "addr_test1zrmx2wvrdqurqgp2wg4v8v9g27zugxezyt75as9zkycyda2jduk3c6ecrpkrk8qqlr4ep37cx03ytlcn70n93zyemj6s4mgt63";
const REF_TOKEN: &str = "85b95fee1b7cf6f2a7dca818e77b901ff3c1b6aae4473219cf56902b.61646d696e";

#[derive(Default)]
struct Recorder {
    hosts: Mutex<Vec<(String, String)>>,
}

impl ClientProvisioner for Recorder {
    fn generate<'a>(&'a self, asset_name: &'a [u8], host: &'a str, _port: u16) -> ProvisionFuture<'a> {
        Box::pin(async move {
            self.hosts
                .lock()
                .unwrap()
                .push((hex::encode(asset_name), host.to_string()));
            Ok(hex::encode(asset_name))
        })
    }
}

fn settings() -> IndexerSettings {
    IndexerSettings {
        script_address: SCRIPT.to_string(),
        reference_token: REF_TOKEN.to_string(),
        intersect_hash: "ab".repeat(32),
        intersect_slot: 42,
        region: "us-east".to_string(),
        domain: "vpn.example".to_string(),
        port: 1194,
        sync_log_interval: Duration::from_millis(20),
    }
}

fn indexer(store: &StateStore) -> (Indexer, Arc<Recorder>, Arc<IndexerMetrics>) {
    let recorder = Arc::new(Recorder::default());
    let metrics = Arc::new(IndexerMetrics::new());
    let indexer = Indexer::new(settings(), store.clone(), recorder.clone(), metrics.clone()).unwrap();
    (indexer, recorder, metrics)
}

fn status(slot: u64, tip_reached: bool) -> ChainEvent {
    ChainEvent::Status(SyncStatus {
        slot,
        block_hash: BlockHash::new([slot as u8; 32]),
        tip_slot: 300,
        tip_reached,
    })
}

fn client_tx(slot: u64, asset: &[u8], region: &str) -> ChainEvent {
    let policy = ScriptAddress::parse(SCRIPT).unwrap().payment_hash();
    let datum = ClientDatum {
        credential: vec![0x11; 28],
        region: region.to_string(),
        expiration_ms: 1_900_000_000_000,
    };
    ChainEvent::Transaction(TransactionEvent {
        tx_hash: TxHash::new([slot as u8; 32]),
        block: ChainPosition::new(BlockHash::new([slot as u8; 32]), slot),
        outputs: vec![TxOutput {
            index: 0,
            address: SCRIPT.to_string(),
            assets: vec![AssetEntry {
                policy_id: policy,
                name: asset.to_vec(),
                quantity: 1,
            }],
            datum: Some(datum.to_cbor().unwrap()),
        }],
    })
}

fn reference_tx(slot: u64) -> ChainEvent {
    let token: AssetId = REF_TOKEN.parse().unwrap();
    let datum = ReferenceDatum {
        prices: vec![PricePlan {
            duration: 86_400_000,
            price: 1_000_000,
        }],
        regions: vec!["us-east".to_string(), "eu-west".to_string()],
    };
    ChainEvent::Transaction(TransactionEvent {
        tx_hash: TxHash::new([0xee; 32]),
        block: ChainPosition::new(BlockHash::new([slot as u8; 32]), slot),
        outputs: vec![TxOutput {
            index: 1,
            address: SCRIPT.to_string(),
            assets: vec![AssetEntry {
                policy_id: token.policy_id,
                name: token.name,
                quantity: 1,
            }],
            datum: Some(datum.to_cbor().unwrap()),
        }],
    })
}

#[tokio::test]
async fn routes_events_until_feed_closes() {
    let store = StateStore::open_in_memory().unwrap();
    let (mut indexer, recorder, metrics) = indexer(&store);
    let (source, handle) = ChannelSource::new(16);
    let feed = source.start(indexer.intersect_points().unwrap()).unwrap();

    for event in [
        status(100, false),
        reference_tx(101),
        client_tx(102, b"local", "us-east"),
        client_tx(103, b"remote", "eu-west"),
        status(104, true),
    ] {
        handle.events.send(event).await.unwrap();
    }
    drop(handle);

    let summary = indexer.run(feed).await.unwrap();
    assert_eq!(summary.transactions, 3);
    assert_eq!(summary.status_updates, 2);
    assert_eq!(summary.routed.references, 1);
    assert_eq!(summary.routed.clients, 2);
    assert_eq!(summary.routed.provisioned, 1);

    let reference = store.reference_data().unwrap().unwrap();
    assert_eq!(reference.regions, vec!["us-east", "eu-west"]);
    assert!(store.client_by_asset_name(b"remote").unwrap().is_some());

    let hosts = recorder.hosts.lock().unwrap();
    assert_eq!(hosts.as_slice(), &[(hex::encode(b"local"), "us-east.vpn.example".to_string())]);

    assert_eq!(metrics.slot(), 104);
    assert_eq!(metrics.tip_slot(), 300);
    assert!(indexer.tracker().tip_reached());
    assert!(!indexer.tracker().catch_up_log_running());
}

#[tokio::test]
async fn resumes_from_cursor_after_restart() {
    let store = StateStore::open_in_memory().unwrap();
    let (indexer_a, _, _) = indexer(&store);

    // Fresh store falls back to the configured start point.
    let points = indexer_a.intersect_points().unwrap();
    assert_eq!(points, vec![ChainPosition::new(BlockHash::new([0xab; 32]), 42)]);

    let mut indexer_a = indexer_a;
    let (source, handle) = ChannelSource::new(4);
    let feed = source.start(points).unwrap();
    handle.events.send(status(50, false)).await.unwrap();
    handle.events.send(status(51, false)).await.unwrap();
    drop(handle);
    indexer_a.run(feed).await.unwrap();

    let (indexer_b, _, _) = indexer(&store);
    let slots: Vec<u64> = indexer_b
        .intersect_points()
        .unwrap()
        .iter()
        .map(|p| p.slot)
        .collect();
    assert_eq!(slots, vec![51, 50]);
}

#[tokio::test]
async fn no_start_point_means_origin() {
    let store = StateStore::open_in_memory().unwrap();
    let mut settings = settings();
    settings.intersect_hash.clear();
    let indexer = Indexer::new(
        settings,
        store,
        Arc::new(Recorder::default()),
        Arc::new(IndexerMetrics::new()),
    )
    .unwrap();
    assert!(indexer.intersect_points().unwrap().is_empty());
}

#[tokio::test]
async fn pipeline_error_stops_the_run() {
    let store = StateStore::open_in_memory().unwrap();
    let (mut indexer, _, _) = indexer(&store);
    let (source, handle) = ChannelSource::new(4);
    let feed = source.start(Vec::new()).unwrap();

    handle.events.send(status(10, false)).await.unwrap();
    handle
        .errors
        .send("connection reset by peer".to_string())
        .await
        .unwrap();

    // Event sender stays open; the error alone must end the run.
    let result = indexer.run(feed).await;
    assert!(matches!(result, Err(IndexerError::Pipeline(ref m)) if m.contains("reset")));
    assert!(!indexer.tracker().catch_up_log_running());
    drop(handle);
}

#[test]
fn bad_settings_are_config_errors() {
    let store = StateStore::open_in_memory().unwrap();
    let build = |settings: IndexerSettings| {
        Indexer::new(
            settings,
            store.clone(),
            Arc::new(Recorder::default()),
            Arc::new(IndexerMetrics::new()),
        )
    };

    let mut bad_address = settings();
    bad_address.script_address = "addr_test1notbech32".to_string();
    assert!(matches!(build(bad_address), Err(IndexerError::Config(_))));

    let mut bad_token = settings();
    bad_token.reference_token = "nodot".to_string();
    assert!(matches!(build(bad_token), Err(IndexerError::Config(_))));

    let mut bad_hash = settings();
    bad_hash.intersect_hash = "zz".to_string();
    assert!(matches!(build(bad_hash), Err(IndexerError::Config(_))));
}
