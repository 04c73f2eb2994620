/// Pipeline Module
///
/// Orchestrates ingestion: Fetch → Transform → Load, one block at a time,
/// retrying each block until it is stored, and statistics tracking.
///
/// Live mode follows the chain head forever; historical mode replays a fixed
/// range once. A storage handle lives for one poll cycle (live) or one block
/// (historical) and is closed on every exit path.
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::{
    config::{ChainId, IngestMode, RetryPolicy},
    cursor::Cursor,
    error::IngestError,
    etl,
    models::Block,
    rpc::BlockSource,
    storage::{Capabilities, Connector, StorageAdapter},
};

/// Errors kept for the final report
const MAX_RECORDED_ERRORS: usize = 100;

/// Pipeline execution statistics
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub blocks_attempted: usize,
    pub blocks_succeeded: usize,
    pub blocks_failed: usize,
    pub stuck_signals: usize,
    pub extrinsics_processed: usize,
    pub events_processed: usize,
    pub elapsed_time: Duration,
    pub errors: Vec<PipelineError>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success_rate(&self) -> f64 {
        if self.blocks_attempted == 0 {
            0.0
        } else {
            (self.blocks_succeeded as f64 / self.blocks_attempted as f64) * 100.0
        }
    }

    pub fn blocks_per_second(&self) -> f64 {
        let secs = self.elapsed_time.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.blocks_succeeded as f64 / secs
        }
    }

    fn record_success(&mut self, block: &Block) {
        self.blocks_attempted += 1;
        self.blocks_succeeded += 1;
        self.extrinsics_processed += block.extrinsics.len();
        self.events_processed += block.event_count();
    }

    fn record_failure(&mut self, block: u64, error: &IngestError) {
        self.blocks_attempted += 1;
        self.blocks_failed += 1;
        if self.errors.len() < MAX_RECORDED_ERRORS {
            self.errors.push(PipelineError {
                stage: PipelineStage::of(error),
                block,
                message: error.to_string(),
                retryable: !error.is_permanent(),
            });
        }
    }
}

/// Pipeline error with context
#[derive(Debug, Clone)]
pub struct PipelineError {
    pub stage: PipelineStage,
    pub block: u64,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Fetch,
    Transform,
    Load,
}

impl PipelineStage {
    fn of(error: &IngestError) -> Self {
        match error {
            IngestError::Validation { .. } => Self::Transform,
            IngestError::Connection(_) | IngestError::Storage(_) => Self::Load,
            IngestError::Stuck { source, .. } => Self::of(source),
            _ => Self::Fetch,
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::Fetch => write!(f, "Fetch"),
            PipelineStage::Transform => write!(f, "Transform"),
            PipelineStage::Load => write!(f, "Load"),
        }
    }
}

/// Configuration for pipeline execution
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chain: ChainId,
    /// Idle wait between head polls in live mode
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

/// How one block's retry loop ended
enum Outcome {
    Stored,
    /// The storage handle is unusable; open a new one before continuing
    Reconnect,
    Cancelled,
}

/// Attempt bookkeeping for the block currently being ingested
struct BlockRetry {
    id: u64,
    attempts: u32,
    /// Permanent failures since the last transient one
    consecutive_permanent: u32,
}

impl BlockRetry {
    fn new(id: u64) -> Self {
        Self { id, attempts: 0, consecutive_permanent: 0 }
    }

    fn record(&mut self, error: &IngestError) {
        self.attempts += 1;
        if error.is_permanent() {
            self.consecutive_permanent += 1;
        } else {
            self.consecutive_permanent = 0;
        }
    }
}

/// Main ingestion pipeline for one `(relay_chain, chain)`
pub struct Pipeline<S, C> {
    source: S,
    connector: C,
    config: PipelineConfig,
    stop: CancellationToken,
}

impl<S: BlockSource, C: Connector> Pipeline<S, C> {
    /// Create a new pipeline instance
    pub fn new(source: S, connector: C, config: PipelineConfig, stop: CancellationToken) -> Self {
        Self { source, connector, config, stop }
    }

    /// Run until the range is done (historical) or the stop signal fires.
    ///
    /// Only a historical block that exhausts its retry budget ends the run
    /// with an error.
    pub async fn run(&self, mode: IngestMode) -> Result<PipelineStats, IngestError> {
        let start_time = Instant::now();
        let mut stats = PipelineStats::new();
        let historical = matches!(mode, IngestMode::Historical { .. });

        println!("\n🚀 Starting ingestion pipeline for {}...", self.config.chain);
        match mode {
            IngestMode::Live => println!("   📡 Mode: live (polling every {:?})", self.config.poll_interval),
            IngestMode::Historical { start, end } => println!("   📍 Block range: {} to {}", start, end),
        }
        println!("   🔄 Retry delay: {:?} up to {:?}", self.config.retry.initial_delay, self.config.retry.max_delay);

        if self.initialize(historical).await? {
            match mode {
                IngestMode::Live => self.run_live(&mut stats).await,
                IngestMode::Historical { start, end } => {
                    if let Err(e) = self.run_historical(start, end, &mut stats).await {
                        stats.elapsed_time = start_time.elapsed();
                        self.print_final_stats(&stats);
                        return Err(e);
                    }
                }
            }
        }

        stats.elapsed_time = start_time.elapsed();

        if self.stop.is_cancelled() {
            println!("\n🛑 Pipeline stopped.");
        } else {
            println!("\n✅ Pipeline complete!");
        }
        self.print_final_stats(&stats);

        Ok(stats)
    }

    /// Create the schema, retrying until the backend is reachable. Returns
    /// `false` if stopped first.
    async fn initialize(&self, historical: bool) -> Result<bool, IngestError> {
        let mut attempts = 0u32;

        loop {
            match self.prepare_storage().await {
                Ok(capabilities) => {
                    if !capabilities.native_upsert {
                        tracing::warn!(
                            "Backend cannot overwrite rows in place; re-ingested blocks are deduplicated at read time"
                        );
                    }
                    tracing::info!(
                        "Storage ready for {} (native upsert: {}, nested types: {})",
                        self.config.chain,
                        capabilities.native_upsert,
                        capabilities.nested_types
                    );
                    return Ok(true);
                }
                Err(e) => {
                    attempts += 1;
                    if historical && self.config.retry.max_attempts.is_some_and(|max| attempts >= max) {
                        return Err(e);
                    }

                    tracing::warn!("Storage initialization failed ({}), retrying ({}): {}", e.kind(), attempts, e);
                    if !self.pause(self.config.retry.delay_for(attempts)).await {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn prepare_storage(&self) -> Result<Capabilities, IngestError> {
        let store = self.connector.connect().await?;
        let result = store.ensure_schema(&self.config.chain).await;
        let capabilities = store.capabilities();
        self.release(store).await;

        result?;
        Ok(capabilities)
    }

    /// Ingest `start..=end` in order, one storage handle per block
    async fn run_historical(&self, start: u64, end: u64, stats: &mut PipelineStats) -> Result<(), IngestError> {
        let total = end.saturating_sub(start).saturating_add(1);

        for id in start..=end {
            let mut retry = BlockRetry::new(id);

            loop {
                if self.stop.is_cancelled() {
                    tracing::info!("Stop requested before block {}", id);
                    return Ok(());
                }

                let store = match self.connector.connect().await {
                    Ok(store) => store,
                    Err(e) => {
                        let delay = self.handle_failure(&mut retry, e.into(), true, stats)?;
                        if !self.pause(delay).await {
                            return Ok(());
                        }
                        continue;
                    }
                };

                let outcome = self.process_with_retry(&mut retry, store.as_ref(), true, stats).await;
                self.release(store).await;

                match outcome? {
                    Outcome::Stored => break,
                    Outcome::Reconnect => continue,
                    Outcome::Cancelled => return Ok(()),
                }
            }

            let done = id - start + 1;
            if done % 100 == 0 || done == total {
                println!(
                    "   📊 Progress: {}/{} blocks ({:.1}%) | ✅ {} stored | 🔁 {} failed attempts",
                    done,
                    total,
                    (done as f64 / total as f64) * 100.0,
                    stats.blocks_succeeded,
                    stats.blocks_failed
                );
            }
        }

        Ok(())
    }

    /// Follow the head until stopped. Errors end the current cycle only.
    async fn run_live(&self, stats: &mut PipelineStats) {
        let mut cursor = Cursor::new(self.config.chain.clone());

        while !self.stop.is_cancelled() {
            if let Err(e) = self.live_tick(&mut cursor, stats).await {
                tracing::warn!("Poll cycle failed ({}), waiting for the next poll: {}", e.kind(), e);
            }

            if !self.pause(self.config.poll_interval).await {
                break;
            }
        }
    }

    /// One poll cycle: read the head, ingest every block up to it, then
    /// re-read the cursor from storage.
    async fn live_tick(&self, cursor: &mut Cursor, stats: &mut PipelineStats) -> Result<(), IngestError> {
        let head = self.source.fetch_head().await?;
        let store = self.connector.connect().await?;

        let result = self.live_cycle(cursor, head, store.as_ref(), stats).await;
        self.release(store).await;
        result
    }

    async fn live_cycle(
        &self,
        cursor: &mut Cursor,
        head: u64,
        store: &dyn StorageAdapter,
        stats: &mut PipelineStats,
    ) -> Result<(), IngestError> {
        if !cursor.refresh(store, head).await? {
            return Ok(());
        }

        let Some(pending) = cursor.pending(head) else {
            tracing::debug!("No new blocks (head {}, last stored {:?})", head, cursor.last_known());
            return Ok(());
        };

        tracing::info!("Head is {}, ingesting blocks {} to {}", head, pending.start(), pending.end());

        for id in pending {
            if self.stop.is_cancelled() {
                return Ok(());
            }

            let mut retry = BlockRetry::new(id);
            match self.process_with_retry(&mut retry, store, false, stats).await? {
                Outcome::Stored => {}
                Outcome::Reconnect | Outcome::Cancelled => return Ok(()),
            }
        }

        cursor.sync(store).await?;
        tracing::debug!("Cursor at {:?}, next block {:?}", cursor.last_known(), cursor.next_block());
        Ok(())
    }

    /// Fetch, transform and store one block until it succeeds. Every attempt
    /// redoes all three steps.
    async fn process_with_retry(
        &self,
        retry: &mut BlockRetry,
        store: &dyn StorageAdapter,
        historical: bool,
        stats: &mut PipelineStats,
    ) -> Result<Outcome, IngestError> {
        loop {
            if self.stop.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            match etl::ingest_block(&self.source, store, &self.config.chain, retry.id).await {
                Ok(block) => {
                    stats.record_success(&block);
                    if retry.attempts > 0 {
                        tracing::info!("Block {} stored after {} failed attempts", retry.id, retry.attempts);
                    } else {
                        tracing::info!("Block {} stored", retry.id);
                    }
                    return Ok(Outcome::Stored);
                }
                Err(e) => {
                    let reconnect = matches!(e, IngestError::Connection(_));
                    let delay = self.handle_failure(retry, e, historical, stats)?;

                    if !self.pause(delay).await {
                        return Ok(Outcome::Cancelled);
                    }
                    if reconnect {
                        return Ok(Outcome::Reconnect);
                    }
                }
            }
        }
    }

    /// Log and count a failed attempt and decide how long to wait. Historical
    /// blocks that cannot succeed come back as [`IngestError::Stuck`].
    fn handle_failure(
        &self,
        retry: &mut BlockRetry,
        error: IngestError,
        historical: bool,
        stats: &mut PipelineStats,
    ) -> Result<Duration, IngestError> {
        let policy = &self.config.retry;
        retry.record(&error);
        stats.record_failure(retry.id, &error);

        tracing::warn!(
            "Block {} attempt {} failed [{}]: {}",
            retry.id,
            retry.attempts,
            error.kind(),
            error
        );

        if policy.stuck_after > 0 && retry.attempts % policy.stuck_after == 0 {
            stats.stuck_signals += 1;
            tracing::error!(
                "Block {} is stuck: {} failed attempts, last error [{}]: {}",
                retry.id,
                retry.attempts,
                error.kind(),
                error
            );
        }

        if historical {
            let exhausted = policy.max_attempts.is_some_and(|max| retry.attempts >= max);
            let hopeless = error.is_permanent() && retry.consecutive_permanent >= policy.stuck_after;
            if exhausted || hopeless {
                return Err(IngestError::Stuck { block: retry.id, attempts: retry.attempts, source: Box::new(error) });
            }
        }

        Ok(policy.delay_for(retry.attempts))
    }

    /// Sleep unless stopped first. Returns `false` if the stop signal fired.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn release(&self, store: Box<dyn StorageAdapter>) {
        if let Err(e) = store.close().await {
            tracing::warn!("Failed to close {} storage handle: {}", store.name(), e);
        }
    }

    /// Print final statistics
    fn print_final_stats(&self, stats: &PipelineStats) {
        println!("\n📊 Pipeline Statistics:");
        println!("   ⏱️  Total time: {:.2}s", stats.elapsed_time.as_secs_f64());
        println!(
            "   📦 Attempts: {} total, {} stored, {} failed",
            stats.blocks_attempted, stats.blocks_succeeded, stats.blocks_failed
        );
        println!("   ✅ Success rate: {:.1}%", stats.success_rate());
        println!("   📝 Extrinsics processed: {}", stats.extrinsics_processed);
        println!("   🔔 Events processed: {}", stats.events_processed);
        println!("   ⚡ Speed: {:.2} blocks/sec", stats.blocks_per_second());

        if stats.stuck_signals > 0 {
            println!("   🧱 Stuck signals: {}", stats.stuck_signals);
        }

        if !stats.errors.is_empty() {
            println!("\n❌ Errors encountered: {}", stats.blocks_failed);
            for (i, error) in stats.errors.iter().take(5).enumerate() {
                let kind = if error.retryable { "transient" } else { "permanent" };
                println!("   {}. [{}] Block {} ({}): {}", i + 1, error.stage, error.block, kind, error.message);
            }
            if stats.blocks_failed > 5 {
                println!("   ... and {} more errors", stats.blocks_failed - 5);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        storage::memory::MemoryStore,
        test_utils::{sample_block, sample_payload, Reply, ScriptedSource},
    };
    use serde_json::json;

    fn chain() -> ChainId {
        ChainId::new("polkadot", "assethub").unwrap()
    }

    fn config(stuck_after: u32, max_attempts: Option<u32>) -> PipelineConfig {
        PipelineConfig {
            chain: chain(),
            poll_interval: Duration::from_millis(1),
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                stuck_after,
                max_attempts,
            },
        }
    }

    fn pipeline(
        source: &ScriptedSource,
        store: &MemoryStore,
        config: PipelineConfig,
    ) -> Pipeline<ScriptedSource, MemoryStore> {
        Pipeline::new(source.clone(), store.clone(), config, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_fresh_live_run_starts_at_head() {
        let source = ScriptedSource::with_heads(&[100, 100]);
        let store = MemoryStore::new();
        let pipeline = pipeline(&source, &store, config(10, None));
        let mut cursor = Cursor::new(chain());
        let mut stats = PipelineStats::new();

        // first poll only positions the cursor
        pipeline.live_tick(&mut cursor, &mut stats).await.unwrap();
        assert_eq!(cursor.last_known(), Some(99));
        assert!(source.requests().is_empty());
        assert!(store.numbers(&chain()).is_empty());

        pipeline.live_tick(&mut cursor, &mut stats).await.unwrap();
        assert_eq!(source.requests(), vec![100]);
        assert_eq!(store.numbers(&chain()), vec![100]);
        assert_eq!(store.get(&chain(), 99), None);
        assert_eq!(cursor.last_known(), Some(100));
        assert_eq!(store.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_live_run_is_gap_free() {
        let source = ScriptedSource::with_heads(&[9, 9, 12]);
        let store = MemoryStore::new();
        store.seed(sample_block(5));
        source.script(7, vec![Reply::Status(503), Reply::Status(502)]);
        let pipeline = pipeline(&source, &store, config(10, None));
        let mut cursor = Cursor::new(chain());
        let mut stats = PipelineStats::new();

        for _ in 0..3 {
            pipeline.live_tick(&mut cursor, &mut stats).await.unwrap();
        }

        assert_eq!(store.numbers(&chain()), (5..=12).collect::<Vec<_>>());
        assert_eq!(store.upserts(), (6..=12).collect::<Vec<_>>());
        assert_eq!(source.attempts(7), 3);
        assert_eq!(stats.blocks_succeeded, 7);
        assert_eq!(stats.blocks_failed, 2);
    }

    #[tokio::test]
    async fn test_live_connection_failure_waits_for_next_poll() {
        let source = ScriptedSource::with_heads(&[3]);
        let store = MemoryStore::new();
        store.seed(sample_block(2));
        store.fail_connects(1);
        let pipeline = pipeline(&source, &store, config(10, None));
        let mut cursor = Cursor::new(chain());
        let mut stats = PipelineStats::new();

        let err = pipeline.live_tick(&mut cursor, &mut stats).await.unwrap_err();
        assert_eq!(err.kind(), "connection");
        assert!(source.requests().is_empty());

        pipeline.live_tick(&mut cursor, &mut stats).await.unwrap();
        assert_eq!(store.numbers(&chain()), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_historical_retries_transient_failure() {
        let source = ScriptedSource::default();
        source.script(11, vec![Reply::Status(503)]);
        let store = MemoryStore::new();
        store.fail_upserts(11, 1);
        let pipeline = pipeline(&source, &store, config(10, None));

        let stats = pipeline.run(IngestMode::Historical { start: 10, end: 12 }).await.unwrap();

        assert_eq!(store.numbers(&chain()), vec![10, 11, 12]);
        assert_eq!(source.attempts(11), 3);
        assert_eq!(stats.blocks_succeeded, 3);
        assert_eq!(stats.errors[0].stage, PipelineStage::Fetch);
        assert_eq!(stats.errors[1].stage, PipelineStage::Load);
        assert_eq!(store.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_block_is_retried_not_stored() {
        let source = ScriptedSource::default();
        source.script(42, vec![Reply::Other(43)]);
        let store = MemoryStore::new();
        let pipeline = pipeline(&source, &store, config(10, None));

        pipeline.run(IngestMode::Historical { start: 42, end: 42 }).await.unwrap();

        assert_eq!(source.attempts(42), 2);
        assert_eq!(store.numbers(&chain()), vec![42]);
        assert_eq!(store.get(&chain(), 42), Some(sample_block(42)));
        assert_eq!(store.upserts(), vec![42]);
    }

    #[tokio::test]
    async fn test_invalid_block_is_never_partially_stored() {
        let mut bad = sample_payload(8);
        bad["extrinsics"][0]["success"] = json!(null);
        let source = ScriptedSource::default();
        source.script(8, vec![Reply::Raw(bad)]);
        let store = MemoryStore::new();
        let pipeline = pipeline(&source, &store, config(10, None));

        let stats = pipeline.run(IngestMode::Historical { start: 8, end: 8 }).await.unwrap();

        assert_eq!(store.upserts(), vec![8]);
        assert_eq!(stats.errors[0].stage, PipelineStage::Transform);
    }

    #[tokio::test]
    async fn test_permanent_error_surfaces_as_stuck() {
        let source = ScriptedSource::default();
        source.script(7, vec![Reply::Status(404); 5]);
        let store = MemoryStore::new();
        let pipeline = pipeline(&source, &store, config(2, None));

        let err = pipeline.run(IngestMode::Historical { start: 6, end: 8 }).await.unwrap_err();

        match err {
            IngestError::Stuck { block, attempts, source: cause } => {
                assert_eq!(block, 7);
                assert_eq!(attempts, 2);
                assert!(matches!(*cause, IngestError::UnexpectedStatus { status: 404, .. }));
            }
            other => panic!("expected a stuck block, got {:?}", other),
        }
        assert_eq!(store.numbers(&chain()), vec![6]);
        assert_eq!(store.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_after_transient_run_is_retried() {
        let mut replies = vec![Reply::Status(503); 9];
        replies.push(Reply::Status(404));
        let source = ScriptedSource::default();
        source.script(7, replies);
        let store = MemoryStore::new();
        let pipeline = pipeline(&source, &store, config(10, None));

        let stats = pipeline.run(IngestMode::Historical { start: 7, end: 7 }).await.unwrap();

        assert_eq!(source.attempts(7), 11);
        assert_eq!(store.numbers(&chain()), vec![7]);
        assert_eq!(stats.blocks_failed, 10);
        assert_eq!(stats.stuck_signals, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_respect_max_attempts() {
        let source = ScriptedSource::default();
        source.script(1, vec![Reply::Status(503); 10]);
        let store = MemoryStore::new();
        let pipeline = pipeline(&source, &store, config(2, Some(3)));

        let err = pipeline.run(IngestMode::Historical { start: 1, end: 1 }).await.unwrap_err();

        assert!(matches!(err, IngestError::Stuck { block: 1, attempts: 3, .. }));
        assert_eq!(source.attempts(1), 3);
    }

    #[tokio::test]
    async fn test_historical_reconnects_after_connection_failure() {
        let source = ScriptedSource::default();
        let store = MemoryStore::new();
        let pipeline = pipeline(&source, &store, config(10, None));

        let stats = pipeline.run(IngestMode::Historical { start: 1, end: 1 }).await.unwrap();
        assert_eq!(stats.blocks_succeeded, 1);

        store.fail_connects(2);
        pipeline.run(IngestMode::Historical { start: 2, end: 3 }).await.unwrap();
        assert_eq!(store.numbers(&chain()), vec![1, 2, 3]);
        assert_eq!(store.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_stop_signal_ends_live_run() {
        let source = ScriptedSource::with_heads(&[50]);
        let store = MemoryStore::new();
        let stop = CancellationToken::new();
        let pipeline = Pipeline::new(source.clone(), store.clone(), config(10, None), stop.clone());

        stop.cancel();
        let stats = pipeline.run(IngestMode::Live).await.unwrap();

        assert_eq!(stats.blocks_attempted, 0);
        assert!(source.requests().is_empty());
    }
}
