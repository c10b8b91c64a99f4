//! Block Processor
//!
//! Drives one block at a time through fetch, decode, apply, settle and
//! seal, then commits the unit of work together with the checkpoint.
//! Rule violations void a single directive. Anything fatal drops the unit
//! of work so the same height can be retried from scratch.

use crate::{
    distribution::AdvertisementTerms,
    error::{LedgerError, LedgerResult, RuleViolation, StructuralError},
    rows::{BlockRef, RowId},
    signer::resolve_signer,
    store::{LedgerStore, UnitOfWork},
    tokens::TokenTerms,
};
use orbit_chain::{BlockHeader, ChainError, ChainSource, ChainStatus, RawTransaction};
use orbit_protocol::{
    script::{data_carrier_payload, decode_hex},
    AdminRequirement, DecodeError, Directive, DirectiveCodec, Network, Operation,
    MAX_TX_BATCH,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

/// Processor settings taken from the node configuration
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Height of the first block ever processed
    pub launch_height: u64,
    pub network: Network,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            launch_height: Network::Mainnet.launch_height(),
            network: Network::Mainnet,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Chain source error: {0}")]
    Chain(#[from] ChainError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Sync worker failed: {0}")]
    Worker(String),
}

impl SyncError {
    /// Ledger failures end syncing; chain failures may be retried
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::Chain(_))
    }
}

/// Where the processor is within the current block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum BlockStage {
    Pending = 0,
    Fetching = 1,
    Decoding = 2,
    Applying = 3,
    Settling = 4,
    Sealing = 5,
    Committed = 6,
}

impl BlockStage {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BlockStage::Fetching,
            2 => BlockStage::Decoding,
            3 => BlockStage::Applying,
            4 => BlockStage::Settling,
            5 => BlockStage::Sealing,
            6 => BlockStage::Committed,
            _ => BlockStage::Pending,
        }
    }
}

/// Outcome of one committed block
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockSummary {
    pub height: u64,
    pub hash: String,
    pub transactions: usize,
    pub applied: usize,
    pub voided: usize,
    pub payments: usize,
    pub digest: String,
}

/// Sync status of the node against its chain source
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub launch_height: u64,
    pub header_height: Option<u64>,
    pub best_height: Option<u64>,
    pub pruned: Option<bool>,
    pub prune_height: Option<u64>,
    pub last_height: Option<u64>,
    pub stage: BlockStage,
}

impl NodeInfo {
    /// Headers the source knows about but has not validated yet
    pub fn pending_on_source(&self) -> Option<u64> {
        Some(self.header_height?.saturating_sub(self.best_height?))
    }

    /// Blocks between the checkpoint and the source's best height
    pub fn to_sync(&self) -> Option<u64> {
        let best = self.best_height?;
        let last = self
            .last_height
            .unwrap_or_else(|| self.launch_height.saturating_sub(1));
        Some(best.saturating_sub(last))
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show(value: Option<u64>) -> String {
            value.map_or_else(|| "-".to_string(), |v| v.to_string())
        }

        writeln!(f, "launch height:        {}", self.launch_height)?;
        writeln!(f, "source header height: {}", show(self.header_height))?;
        writeln!(f, "source best height:   {}", show(self.best_height))?;
        writeln!(f, "pending on source:    {}", show(self.pending_on_source()))?;
        match (self.pruned, self.prune_height) {
            (Some(true), Some(height)) => writeln!(f, "pruned:               yes, below {}", height)?,
            (Some(true), None) => writeln!(f, "pruned:               yes")?,
            (Some(false), _) => writeln!(f, "pruned:               no")?,
            (None, _) => writeln!(f, "pruned:               -")?,
        }
        writeln!(f, "last synced height:   {}", show(self.last_height))?;
        writeln!(f, "blocks to sync:       {}", show(self.to_sync()))?;
        write!(f, "stage:                {:?}", self.stage)
    }
}

/// Decoded contents of one transaction, before anything is applied
struct TxPlan {
    tx: RawTransaction,
    directives: Vec<Result<Directive, DecodeError>>,
    payments: Vec<PaymentCandidate>,
}

/// A value-carrying output that may pay an issuer
struct PaymentCandidate {
    value: u64,
    addresses: Vec<String>,
}

/// Per-transaction state while applying
struct TxContext<'t> {
    tx: &'t RawTransaction,
    row: Option<RowId>,
    signer: Option<Option<String>>,
}

impl<'t> TxContext<'t> {
    fn new(tx: &'t RawTransaction) -> Self {
        Self {
            tx,
            row: None,
            signer: None,
        }
    }

    /// Store the transaction's audit rows the first time it matters
    fn row(&mut self, uow: &mut UnitOfWork<'_>, block: BlockRef) -> RowId {
        match self.row {
            Some(row) => row,
            None => {
                let row = uow.save_tx(self.tx, block);
                self.row = Some(row);
                row
            }
        }
    }

    /// Resolved once per transaction
    fn signer(&mut self, uow: &UnitOfWork<'_>, network: Network) -> LedgerResult<Option<String>> {
        if let Some(signer) = &self.signer {
            return Ok(signer.clone());
        }
        let signer = match self.row {
            Some(row) => uow.signer_of(row, network)?,
            None => resolve_signer(
                self.tx
                    .inputs
                    .iter()
                    .filter_map(|input| input.unlock_script.as_deref()),
                network,
            )?,
        };
        self.signer = Some(signer.clone());
        Ok(signer)
    }
}

#[derive(Default)]
struct Tally {
    applied: usize,
    voided: usize,
    payments: usize,
}

impl Tally {
    /// Count a directive outcome, passing fatal errors through
    fn record(&mut self, txid: &str, what: &str, result: LedgerResult<()>) -> LedgerResult<()> {
        match result {
            Ok(()) => {
                self.applied += 1;
                Ok(())
            }
            Err(LedgerError::Violation(violation)) => {
                tracing::warn!("VOID {} in {}: {}", what, txid, violation);
                self.voided += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn plan_transaction(codec: &dyn DirectiveCodec, tx: RawTransaction) -> TxPlan {
    let mut directives = Vec::new();
    let mut payments = Vec::new();

    for output in &tx.outputs {
        let script = match decode_hex(&output.script) {
            Ok(script) => script,
            Err(e) => {
                tracing::warn!("Unreadable output script in {}: {}", tx.txid, e);
                continue;
            }
        };

        match data_carrier_payload(&script) {
            Some(payload) => match payload.and_then(|p| codec.decode(p)) {
                Ok(Some(directive)) => directives.push(Ok(directive)),
                Ok(None) => {}
                Err(e) => directives.push(Err(e)),
            },
            None => {
                if output.value == 0 {
                    continue;
                }
                if let Some(addresses) = output.addresses.as_ref().filter(|a| !a.is_empty()) {
                    payments.push(PaymentCandidate {
                        value: output.value,
                        addresses: addresses.clone(),
                    });
                }
            }
        }
    }

    TxPlan {
        tx,
        directives,
        payments,
    }
}

/// Apply one directive under the admin rule
fn apply_directive(
    uow: &mut UnitOfWork<'_>,
    block: BlockRef,
    tx: RowId,
    signer: Option<&str>,
    directive: Directive,
) -> LedgerResult<()> {
    let signer = signer.ok_or(RuleViolation::NoSigner)?;
    let token = directive.token.as_str();

    let requirement = directive.operation.admin();
    if !requirement.permits(signer == token) {
        return Err(match requirement {
            AdminRequirement::Issuer => RuleViolation::AdminRequired,
            _ => RuleViolation::AdminForbidden,
        }
        .into());
    }

    match directive.operation {
        Operation::Create {
            supply,
            decimals,
            symbol,
            name,
            main_uri,
            image_uri,
        } => uow
            .create_token(
                token,
                tx,
                block,
                TokenTerms {
                    supply,
                    decimals,
                    symbol,
                    name,
                    main_uri,
                    image_uri,
                },
            )
            .map(drop),
        Operation::Transfer { to, units } => {
            uow.transfer(token, tx, block, signer, &to, units).map(drop)
        }
        Operation::Advertise {
            exchange_rate,
            units_avail,
            units_min,
            units_max,
            block_begin,
            block_end,
            block_deliver,
            preregister,
        } => uow
            .advertise(
                token,
                tx,
                block,
                AdvertisementTerms {
                    rate: exchange_rate,
                    units_avail,
                    units_min,
                    units_max,
                    block_begin,
                    block_end,
                    block_deliver,
                    preregister,
                },
            )
            .map(drop),
        Operation::Cancel => uow.cancel_advertisement(token),
        Operation::Register { units_max } => {
            uow.register(token, tx, block, signer, units_max).map(drop)
        }
        Operation::Unregister => uow.unregister(token, block, signer).map(drop),
    }
}

/// Validates chain blocks into the ledger, one height at a time
pub struct BlockProcessor {
    store: Arc<LedgerStore>,
    source: Arc<dyn ChainSource>,
    codec: Arc<dyn DirectiveCodec>,
    config: ProcessorConfig,
    status: Mutex<Option<ChainStatus>>,
    stage: Arc<AtomicU8>,
}

impl BlockProcessor {
    pub fn new(
        store: Arc<LedgerStore>,
        source: Arc<dyn ChainSource>,
        codec: Arc<dyn DirectiveCodec>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            source,
            codec,
            config,
            status: Mutex::new(None),
            stage: Arc::new(AtomicU8::new(BlockStage::Pending as u8)),
        }
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    pub fn stage(&self) -> BlockStage {
        BlockStage::from_u8(self.stage.load(Ordering::SeqCst))
    }

    fn set_stage(&self, stage: BlockStage) {
        set_stage(&self.stage, stage);
    }

    /// Height the next call to [`BlockProcessor::next`] will process
    pub fn target_height(&self) -> u64 {
        self.store
            .last_height()
            .map_or(self.config.launch_height, |height| height + 1)
    }

    /// Re-read chain status; true if the source's best height moved
    pub async fn refresh(&self) -> Result<bool, SyncError> {
        let status = self.source.chain_status().await?;
        let previous = self.status.lock().replace(status.clone());

        let last = self.store.last_height();
        let backlog = (status.best_height + 1).saturating_sub(self.target_height());
        tracing::info!(
            "Chain best height {}, ledger last height {:?}, {} blocks to sync",
            status.best_height,
            last,
            backlog
        );

        Ok(previous.map(|p| p.best_height) != Some(status.best_height))
    }

    /// Status projection from the last refresh
    pub fn info(&self) -> NodeInfo {
        let status = self.status.lock().clone();
        NodeInfo {
            launch_height: self.config.launch_height,
            header_height: status.as_ref().map(|s| s.header_height),
            best_height: status.as_ref().map(|s| s.best_height),
            pruned: status.as_ref().map(|s| s.pruned),
            prune_height: status.as_ref().and_then(|s| s.prune_height),
            last_height: self.store.last_height(),
            stage: self.stage(),
        }
    }

    /// Process the next block; `None` once the source has no more
    pub async fn next(&self) -> Result<Option<BlockSummary>, SyncError> {
        let cached = self.status.lock().clone();
        let status = match cached {
            Some(status) => status,
            None => {
                self.refresh().await?;
                self.status
                    .lock()
                    .clone()
                    .ok_or_else(|| SyncError::Worker("chain status unavailable".to_string()))?
            }
        };

        let height = self.target_height();
        if height > status.best_height {
            tracing::debug!("No more blocks (next {}, best {})", height, status.best_height);
            return Ok(None);
        }

        self.set_stage(BlockStage::Pending);
        let result = self.process(height, status.pruned).await;
        if let Err(e) = &result {
            self.set_stage(BlockStage::Pending);
            if e.is_fatal() {
                tracing::error!("Block {} aborted: {}", height, e);
            }
        }
        result.map(Some)
    }

    async fn process(&self, height: u64, pruned: bool) -> Result<BlockSummary, SyncError> {
        tracing::info!("Processing block {}", height);
        self.set_stage(BlockStage::Fetching);

        let hash = self.source.block_hash(height).await?;
        let header = self.source.block(&hash).await?;

        let hint = pruned.then_some(header.hash.as_str());
        let mut txs = Vec::with_capacity(header.transactions.len());
        for chunk in header.transactions.chunks(MAX_TX_BATCH) {
            txs.extend(self.source.raw_transactions(chunk, hint).await?);
        }
        if txs.len() != header.transactions.len() {
            return Err(ChainError::Malformed(format!(
                "block {} lists {} transactions, source returned {}",
                header.hash,
                header.transactions.len(),
                txs.len()
            ))
            .into());
        }

        self.set_stage(BlockStage::Decoding);
        let plans: Vec<TxPlan> = txs
            .into_iter()
            .map(|tx| plan_transaction(self.codec.as_ref(), tx))
            .collect();

        // Applying and the sled flush run off the async workers
        let store = self.store.clone();
        let stage = self.stage.clone();
        let network = self.config.network;
        let summary = tokio::task::spawn_blocking(move || {
            apply_block(&store, &stage, network, height, &header, plans)
        })
        .await
        .map_err(|e| SyncError::Worker(e.to_string()))??;
        Ok(summary)
    }
}

fn set_stage(current: &AtomicU8, stage: BlockStage) {
    tracing::trace!("Block stage {:?}", stage);
    current.store(stage as u8, Ordering::SeqCst);
}

/// Apply, settle and seal a decoded block, then commit it
fn apply_block(
    store: &LedgerStore,
    stage: &AtomicU8,
    network: Network,
    height: u64,
    header: &BlockHeader,
    plans: Vec<TxPlan>,
) -> LedgerResult<BlockSummary> {
    let mut tally = Tally::default();

    let (changes, digest) = {
        let state = store.committed();
        let mut uow = state.begin();
        let block = uow.save_block(&header.hash, height);

        set_stage(stage, BlockStage::Applying);
        for plan in plans {
            let mut ctx = TxContext::new(&plan.tx);

            for directive in plan.directives {
                let directive = match directive {
                    Ok(directive) => directive,
                    Err(e) => {
                        tracing::warn!("VOID undecodable directive in {}: {}", plan.tx.txid, e);
                        tally.voided += 1;
                        continue;
                    }
                };
                tracing::debug!(
                    "ORBIT {} on {} in {}",
                    directive.operation,
                    directive.token,
                    plan.tx.txid
                );

                let tx = ctx.row(&mut uow, block);
                let signer = ctx.signer(&uow, network)?;
                let what = directive.operation.name();
                let result = apply_directive(&mut uow, block, tx, signer.as_deref(), directive);
                tally.record(&plan.tx.txid, what, result)?;
            }

            for payment in &plan.payments {
                let mut collecting = None;
                for address in &payment.addresses {
                    collecting = uow.collecting_advertisement(address, height)?;
                    if collecting.is_some() {
                        break;
                    }
                }
                let Some(ad) = collecting else {
                    continue;
                };
                if payment.addresses.len() > 1 {
                    return Err(StructuralError::MultiAddressPayment {
                        txid: plan.tx.txid.clone(),
                    }
                    .into());
                }

                let Some(payer) = ctx.signer(&uow, network)? else {
                    continue;
                };
                let Some(registration) = uow.active_registration(ad, &payer)? else {
                    continue;
                };

                let tx = ctx.row(&mut uow, block);
                match uow.settle_payment(tx, block, registration, payment.value) {
                    Ok(_) => tally.payments += 1,
                    Err(LedgerError::Violation(v)) => {
                        tracing::warn!("VOID payment in {}: {}", plan.tx.txid, v);
                        tally.voided += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        set_stage(stage, BlockStage::Settling);
        let settlement = uow.settle_block(block)?;
        if !settlement.finished.is_empty() || settlement.delivered > 0 {
            tracing::info!(
                "Block {} settled: {} units delivered, {} advertisements finished, {} units released",
                height,
                settlement.delivered,
                settlement.finished.len(),
                settlement.released
            );
        }

        set_stage(stage, BlockStage::Sealing);
        let digest = uow.seal(block)?;
        uow.set_last_height(height);
        (uow.finish(), digest)
    };

    store.commit(changes)?;
    set_stage(stage, BlockStage::Committed);

    let summary = BlockSummary {
        height,
        hash: header.hash.clone(),
        transactions: header.transactions.len(),
        applied: tally.applied,
        voided: tally.voided,
        payments: tally.payments,
        digest,
    };
    tracing::info!(
        "Block {}: {} txs, {} applied, {} voided, {} payments, digest {}",
        summary.height,
        summary.transactions,
        summary.applied,
        summary.voided,
        summary.payments,
        summary.digest
    );
    Ok(summary)
}
