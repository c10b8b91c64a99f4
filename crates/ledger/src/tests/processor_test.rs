//! Block Processor Tests
//!
//! Drives the processor against an in-memory chain source:
//! - directives decoded from data-carrier outputs and authorized by signer
//! - payments to issuers settling registrations
//! - voided directives versus fatal aborts and retry
//! - the sync worker catching up and stopping

use crate::{
    BlockProcessor, BlockStage, LedgerError, LedgerStore, ProcessorConfig, StructuralError,
    SyncError, SyncWorker,
};
use async_trait::async_trait;
use orbit_chain::{
    BlockHeader, ChainError, ChainSource, ChainStatus, RawInput, RawOutput, RawTransaction,
};
use orbit_protocol::{
    p2pkh_address,
    script::{data_carrier_script, push},
    Directive, EnvelopeCodec, Network, Operation,
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

const ISSUER_KEY: [u8; 33] = [0x02; 33];
const USER_KEY: [u8; 33] = [0x03; 33];

fn address(key: &[u8]) -> String {
    p2pkh_address(key, Network::Mainnet)
}

/// Blocks indexed by height
#[derive(Default)]
struct MockChain {
    blocks: Mutex<Vec<Vec<RawTransaction>>>,
    batches: Mutex<Vec<usize>>,
}

impl MockChain {
    fn push_block(&self, txs: Vec<RawTransaction>) {
        self.blocks.lock().push(txs);
    }

    fn block_hash_at(height: u64) -> String {
        format!("{:064x}", height + 0xb10c)
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn chain_status(&self) -> Result<ChainStatus, ChainError> {
        let count = self.blocks.lock().len() as u64;
        let best = count
            .checked_sub(1)
            .ok_or_else(|| ChainError::Transport("no blocks".to_string()))?;
        Ok(ChainStatus {
            best_height: best,
            header_height: best,
            pruned: false,
            prune_height: None,
        })
    }

    async fn block_hash(&self, height: u64) -> Result<String, ChainError> {
        if height as usize >= self.blocks.lock().len() {
            return Err(ChainError::Rpc {
                method: "getblockhash".to_string(),
                message: "Block height out of range".to_string(),
            });
        }
        Ok(Self::block_hash_at(height))
    }

    async fn block(&self, hash: &str) -> Result<BlockHeader, ChainError> {
        let blocks = self.blocks.lock();
        let height = (0..blocks.len() as u64)
            .find(|h| Self::block_hash_at(*h) == hash)
            .ok_or_else(|| ChainError::Malformed(format!("unknown block {}", hash)))?;
        Ok(BlockHeader {
            hash: hash.to_string(),
            height,
            transactions: blocks[height as usize]
                .iter()
                .map(|tx| tx.txid.clone())
                .collect(),
        })
    }

    async fn raw_transactions(
        &self,
        txids: &[String],
        _block_hint: Option<&str>,
    ) -> Result<Vec<RawTransaction>, ChainError> {
        self.batches.lock().push(txids.len());
        let blocks = self.blocks.lock();
        txids
            .iter()
            .map(|txid| {
                blocks
                    .iter()
                    .flatten()
                    .find(|tx| &tx.txid == txid)
                    .cloned()
                    .ok_or_else(|| ChainError::Malformed(format!("unknown tx {}", txid)))
            })
            .collect()
    }
}

fn unlock_script(key: &[u8]) -> String {
    let mut script = push(&[0x30; 71]);
    script.extend(push(key));
    hex::encode(script)
}

fn input(key: &[u8]) -> RawInput {
    RawInput {
        txid: Some("00".repeat(32)),
        unlock_script: Some(unlock_script(key)),
    }
}

fn directive_output(token: &str, operation: Operation) -> RawOutput {
    let payload = EnvelopeCodec.encode(&Directive {
        token: token.to_string(),
        operation,
    });
    RawOutput {
        value: 0,
        script_type: "nulldata".to_string(),
        addresses: None,
        script: hex::encode(data_carrier_script(&payload)),
    }
}

fn payment_output(to: &[&str], value: u64) -> RawOutput {
    RawOutput {
        value,
        script_type: "pubkeyhash".to_string(),
        addresses: Some(to.iter().map(|a| a.to_string()).collect()),
        script: "76a914".to_string() + &"11".repeat(20) + "88ac",
    }
}

fn tx(id: &str, inputs: Vec<RawInput>, outputs: Vec<RawOutput>) -> RawTransaction {
    RawTransaction {
        txid: id.repeat(64 / id.len()),
        confirmations: 6,
        inputs,
        outputs,
    }
}

fn create() -> Operation {
    Operation::Create {
        supply: 1_000_000,
        decimals: 2,
        symbol: "ORB".to_string(),
        name: Some("Orbit".to_string()),
        main_uri: None,
        image_uri: None,
    }
}

fn setup(chain: Arc<MockChain>) -> (TempDir, BlockProcessor) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LedgerStore::open(dir.path().join("ledger.db")).unwrap());
    let processor = BlockProcessor::new(
        store,
        chain,
        Arc::new(EnvelopeCodec),
        ProcessorConfig {
            launch_height: 0,
            network: Network::Mainnet,
        },
    );
    (dir, processor)
}

fn holding(processor: &BlockProcessor, token: &str, holder: &str) -> (u64, u64) {
    processor.store().read(|view| {
        view.balance_of(token, holder)
            .map(|b| (b.units, b.available))
            .unwrap_or_default()
    })
}

#[tokio::test]
async fn test_free_distribution_then_transfer() {
    let issuer = address(&ISSUER_KEY);
    let user = address(&USER_KEY);
    let chain = Arc::new(MockChain::default());

    chain.push_block(vec![tx(
        "a1",
        vec![input(&ISSUER_KEY)],
        vec![directive_output(&issuer, create())],
    )]);
    chain.push_block(vec![tx(
        "a2",
        vec![input(&ISSUER_KEY)],
        vec![directive_output(
            &issuer,
            Operation::Advertise {
                exchange_rate: None,
                units_avail: Some(5000),
                units_min: None,
                units_max: Some(1000),
                block_begin: None,
                block_end: None,
                block_deliver: Some(3),
                preregister: false,
            },
        )],
    )]);
    chain.push_block(vec![tx(
        "a3",
        vec![input(&USER_KEY)],
        vec![directive_output(&issuer, Operation::Register { units_max: 1000 })],
    )]);
    chain.push_block(vec![tx(
        "a4",
        vec![input(&USER_KEY)],
        vec![directive_output(
            &issuer,
            Operation::Transfer {
                to: "recipient".to_string(),
                units: 400,
            },
        )],
    )]);

    let (_dir, processor) = setup(chain);
    processor.refresh().await.unwrap();

    for height in 0..=2 {
        let summary = processor.next().await.unwrap().unwrap();
        assert_eq!(summary.height, height);
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.voided, 0);
    }
    assert_eq!(holding(&processor, &issuer, &user), (1000, 0));

    // Delivery happens when block 3 settles, after its transfer was checked
    let summary = processor.next().await.unwrap().unwrap();
    assert_eq!(summary.voided, 1);
    assert_eq!(holding(&processor, &issuer, &user), (1000, 1000));

    assert!(processor.next().await.unwrap().is_none());
    assert_eq!(processor.store().last_height(), Some(3));
    assert_eq!(processor.stage(), BlockStage::Committed);
}

#[tokio::test]
async fn test_issuer_may_not_transfer() {
    let issuer = address(&ISSUER_KEY);
    let chain = Arc::new(MockChain::default());
    chain.push_block(vec![tx(
        "b1",
        vec![input(&ISSUER_KEY)],
        vec![
            directive_output(&issuer, create()),
            directive_output(
                &issuer,
                Operation::Transfer {
                    to: "someone".to_string(),
                    units: 1,
                },
            ),
            // Not signed by the token address
            directive_output("elsewhere", create()),
        ],
    )]);

    let (_dir, processor) = setup(chain);
    let summary = processor.next().await.unwrap().unwrap();

    assert_eq!(summary.applied, 1);
    assert_eq!(summary.voided, 2);
    assert_eq!(holding(&processor, &issuer, &issuer), (1_000_000, 1_000_000));
    assert!(processor.store().read(|view| view.token("elsewhere").is_none()));
}

#[tokio::test]
async fn test_payment_settles_registration() {
    let issuer = address(&ISSUER_KEY);
    let user = address(&USER_KEY);
    let chain = Arc::new(MockChain::default());

    chain.push_block(vec![tx(
        "c1",
        vec![input(&ISSUER_KEY)],
        vec![
            directive_output(&issuer, create()),
            directive_output(
                &issuer,
                Operation::Advertise {
                    exchange_rate: Some(-100),
                    units_avail: Some(10_000),
                    units_min: Some(5),
                    units_max: None,
                    block_begin: None,
                    block_end: Some(5),
                    block_deliver: None,
                    preregister: false,
                },
            ),
        ],
    )]);
    // Registration and its first payment in one transaction
    chain.push_block(vec![tx(
        "c2",
        vec![input(&USER_KEY)],
        vec![
            directive_output(&issuer, Operation::Register { units_max: 50 }),
            payment_output(&[&issuer], 1_000),
            payment_output(&["unrelated"], 7_000),
        ],
    )]);
    chain.push_block(vec![tx(
        "c3",
        vec![input(&USER_KEY), input(&USER_KEY)],
        vec![payment_output(&[&issuer], 9_000)],
    )]);

    let (_dir, processor) = setup(chain);
    processor.refresh().await.unwrap();
    processor.next().await.unwrap().unwrap();

    let summary = processor.next().await.unwrap().unwrap();
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.payments, 1);
    // 1000 sats at 100 sats per unit, delivered when block 1 settles
    assert_eq!(holding(&processor, &issuer, &user), (10, 10));

    let summary = processor.next().await.unwrap().unwrap();
    assert_eq!(summary.payments, 1);
    assert_eq!(holding(&processor, &issuer, &user), (50, 50));

    processor.store().read(|view| {
        let token = view.token(&issuer).unwrap();
        let transfers: Vec<u64> = view.transfers_of_token(token.id).map(|t| t.units).collect();
        assert_eq!(transfers, vec![10, 40]);
    });
}

fn rate_advertisement() -> Operation {
    Operation::Advertise {
        exchange_rate: Some(-100),
        units_avail: Some(10_000),
        units_min: None,
        units_max: None,
        block_begin: None,
        block_end: None,
        block_deliver: None,
        preregister: false,
    }
}

#[tokio::test]
async fn test_payments_without_registrations_are_ignored() {
    let issuer = address(&ISSUER_KEY);
    let other_key = [0x04; 33];
    let chain = Arc::new(MockChain::default());

    chain.push_block(vec![tx(
        "f1",
        vec![input(&ISSUER_KEY)],
        vec![directive_output(&issuer, create())],
    )]);
    // No advertisement yet: two signers, and an output listing the issuer
    chain.push_block(vec![
        tx(
            "f2",
            vec![input(&USER_KEY), input(&other_key)],
            vec![payment_output(&[&issuer], 5_000)],
        ),
        tx(
            "f3",
            vec![input(&USER_KEY)],
            vec![payment_output(&[&issuer, "someone"], 5_000)],
        ),
    ]);
    chain.push_block(vec![tx(
        "f4",
        vec![input(&ISSUER_KEY)],
        vec![directive_output(&issuer, rate_advertisement())],
    )]);
    // Open advertisement, but nobody registered
    chain.push_block(vec![
        tx(
            "f5",
            vec![input(&USER_KEY), input(&other_key)],
            vec![payment_output(&[&issuer], 5_000)],
        ),
        tx(
            "f6",
            vec![input(&USER_KEY)],
            vec![payment_output(&[&issuer, "someone"], 5_000)],
        ),
    ]);

    let (_dir, processor) = setup(chain);
    processor.refresh().await.unwrap();
    for height in 0..=3 {
        let summary = processor.next().await.unwrap().unwrap();
        assert_eq!(summary.height, height);
        assert_eq!(summary.payments, 0);
        assert_eq!(summary.voided, 0);
    }
    assert_eq!(processor.store().last_height(), Some(3));
    assert_eq!(holding(&processor, &issuer, &issuer), (1_000_000, 990_000));
}

#[tokio::test]
async fn test_multi_address_payment_to_registered_issuer_is_fatal() {
    let issuer = address(&ISSUER_KEY);
    let chain = Arc::new(MockChain::default());

    chain.push_block(vec![tx(
        "g1",
        vec![input(&ISSUER_KEY)],
        vec![
            directive_output(&issuer, create()),
            directive_output(&issuer, rate_advertisement()),
        ],
    )]);
    chain.push_block(vec![tx(
        "g2",
        vec![input(&USER_KEY)],
        vec![directive_output(&issuer, Operation::Register { units_max: 50 })],
    )]);
    chain.push_block(vec![tx(
        "g3",
        vec![input(&USER_KEY)],
        vec![payment_output(&["someone", &issuer], 5_000)],
    )]);

    let (_dir, processor) = setup(chain);
    processor.refresh().await.unwrap();
    processor.next().await.unwrap().unwrap();
    processor.next().await.unwrap().unwrap();

    let err = processor.next().await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        SyncError::Ledger(LedgerError::Structural(StructuralError::MultiAddressPayment { .. }))
    ));
    assert_eq!(processor.store().last_height(), Some(1));
    assert_eq!(processor.stage(), BlockStage::Pending);
}

#[tokio::test]
async fn test_undecodable_and_unsigned_are_voided() {
    let issuer = address(&ISSUER_KEY);
    let chain = Arc::new(MockChain::default());

    let mut bad_version = EnvelopeCodec::MAGIC.to_vec();
    bad_version.push(9);
    chain.push_block(vec![
        tx(
            "d1",
            vec![input(&ISSUER_KEY)],
            vec![RawOutput {
                value: 0,
                script_type: "nulldata".to_string(),
                addresses: None,
                script: hex::encode(data_carrier_script(&bad_version)),
            }],
        ),
        tx(
            "d2",
            vec![RawInput {
                txid: None,
                unlock_script: Some("04ffff001d0104".to_string()),
            }],
            vec![directive_output(&issuer, create())],
        ),
        tx(
            "d3",
            vec![],
            vec![RawOutput {
                value: 0,
                script_type: "nulldata".to_string(),
                addresses: None,
                script: hex::encode(data_carrier_script(b"not a directive")),
            }],
        ),
    ]);

    let (_dir, processor) = setup(chain);
    let summary = processor.next().await.unwrap().unwrap();

    assert_eq!(summary.transactions, 3);
    assert_eq!(summary.applied, 0);
    assert_eq!(summary.voided, 2);
    assert_eq!(processor.store().last_height(), Some(0));
}

#[tokio::test]
async fn test_fatal_block_keeps_checkpoint() {
    let issuer = address(&ISSUER_KEY);
    let chain = Arc::new(MockChain::default());
    chain.push_block(vec![tx(
        "e1",
        vec![input(&ISSUER_KEY)],
        vec![directive_output(&issuer, create())],
    )]);
    chain.push_block(vec![tx(
        "e2",
        vec![input(&ISSUER_KEY), input(&USER_KEY)],
        vec![directive_output(&issuer, Operation::Unregister)],
    )]);

    let (_dir, processor) = setup(chain);
    processor.refresh().await.unwrap();
    processor.next().await.unwrap().unwrap();
    let committed = processor.store().read(|view| view.block_at(0).cloned());

    for _ in 0..2 {
        let err = processor.next().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, SyncError::Ledger(_)));
        assert_eq!(processor.store().last_height(), Some(0));
        assert_eq!(processor.stage(), BlockStage::Pending);
    }

    // Nothing from the aborted attempts reached the store
    processor.store().read(|view| {
        assert_eq!(view.block_at(0).cloned(), committed);
        assert!(view.block_at(1).is_none());
    });
}

#[tokio::test]
async fn test_cancel_aborts_block() {
    let issuer = address(&ISSUER_KEY);
    let chain = Arc::new(MockChain::default());
    chain.push_block(vec![tx(
        "f1",
        vec![input(&ISSUER_KEY)],
        vec![
            directive_output(&issuer, create()),
            directive_output(&issuer, Operation::Cancel),
        ],
    )]);

    let (_dir, processor) = setup(chain);
    assert!(processor.next().await.unwrap_err().is_fatal());
    assert_eq!(processor.store().last_height(), None);
}

#[tokio::test]
async fn test_large_blocks_fetched_in_batches() {
    let chain = Arc::new(MockChain::default());
    let txs = (0..2500)
        .map(|i| RawTransaction {
            txid: format!("{:064x}", i),
            confirmations: 1,
            inputs: vec![],
            outputs: vec![],
        })
        .collect();
    chain.push_block(txs);

    let (_dir, processor) = setup(chain.clone());
    let summary = processor.next().await.unwrap().unwrap();

    assert_eq!(summary.transactions, 2500);
    assert_eq!(*chain.batches.lock(), vec![1000, 1000, 500]);
}

#[tokio::test]
async fn test_info_reports_backlog() {
    let chain = Arc::new(MockChain::default());
    for _ in 0..4 {
        chain.push_block(vec![]);
    }

    let (_dir, processor) = setup(chain.clone());
    assert_eq!(processor.info().best_height, None);

    assert!(processor.refresh().await.unwrap());
    assert!(!processor.refresh().await.unwrap());
    processor.next().await.unwrap().unwrap();

    let info = processor.info();
    assert_eq!(info.best_height, Some(3));
    assert_eq!(info.last_height, Some(0));
    assert_eq!(info.to_sync(), Some(3));
    assert!(info.to_string().contains("blocks to sync:       3"));

    chain.push_block(vec![]);
    assert!(processor.refresh().await.unwrap());
}

#[tokio::test]
async fn test_sync_worker_catches_up_and_stops() {
    let chain = Arc::new(MockChain::default());
    for _ in 0..5 {
        chain.push_block(vec![]);
    }

    let (_dir, processor) = setup(chain.clone());
    let processor = Arc::new(processor);
    let handle = SyncWorker::spawn(processor.clone(), Duration::from_millis(20));

    for _ in 0..200 {
        if processor.store().last_height() == Some(4) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(processor.store().last_height(), Some(4));

    chain.push_block(vec![]);
    for _ in 0..200 {
        if processor.store().last_height() == Some(5) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(handle.stop().await.unwrap(), 6);
}
