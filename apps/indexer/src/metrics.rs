use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Gauge, Histogram},
};
use std::sync::Arc;

/// Telemetry capability for one scanner scope. Constructed once at startup
/// and passed by reference into the loop, processor and reorg handler.
#[derive(Clone)]
pub struct ScannerTelemetry {
    inner: Arc<Inner>,
}

struct Inner {
    scope_attrs: Vec<KeyValue>,

    blocks_processed_total: Counter<u64>,
    events_indexed_total: Counter<u64>,
    decode_failures_total: Counter<u64>,
    rpc_errors_total: Counter<u64>,
    db_errors_total: Counter<u64>,
    reorgs_total: Counter<u64>,
    reorg_rollback_blocks_total: Counter<u64>,

    chain_latest_block: Gauge<u64>,
    chain_safe_block: Gauge<u64>,
    last_scanned_block: Gauge<u64>,

    rpc_ms: Histogram<u64>,
    block_process_ms: Histogram<u64>,
}

impl ScannerTelemetry {
    pub fn new(chain_id: i64, contract_address: &str) -> Self {
        let meter = global::meter("staking_indexer");

        let blocks_processed_total = meter
            .u64_counter("scanner.blocks_processed_total")
            .with_description("Total blocks fetched, decoded and committed")
            .build();
        let events_indexed_total = meter
            .u64_counter("scanner.events_indexed_total")
            .with_description("Total staking events written to the journal")
            .build();
        let decode_failures_total = meter
            .u64_counter("scanner.decode_failures_total")
            .with_description("Total tracked logs dropped for malformed topics/data")
            .build();
        let rpc_errors_total = meter
            .u64_counter("scanner.rpc_errors_total")
            .with_description("Total chain RPC call failures")
            .build();
        let db_errors_total = meter
            .u64_counter("scanner.db_errors_total")
            .with_description("Total repository operation failures")
            .build();
        let reorgs_total = meter
            .u64_counter("scanner.reorgs_total")
            .with_description("Total reorgs detected and rolled back")
            .build();
        let reorg_rollback_blocks_total = meter
            .u64_counter("scanner.reorg_rollback_blocks_total")
            .with_description("Cumulative blocks unwound by reorg rollbacks")
            .build();

        let chain_latest_block = meter
            .u64_gauge("scanner.chain_latest_block")
            .with_description("Chain tip height as reported by the node")
            .build();
        let chain_safe_block = meter
            .u64_gauge("scanner.chain_safe_block")
            .with_description("Tip minus the confirmation lag")
            .build();
        let last_scanned_block = meter
            .u64_gauge("scanner.last_scanned_block")
            .with_description("Cursor position after the most recent commit")
            .build();

        let rpc_ms = meter
            .u64_histogram("scanner.rpc_ms")
            .with_description("Chain RPC latency")
            .with_unit("ms")
            .build();
        let block_process_ms = meter
            .u64_histogram("scanner.block_process_ms")
            .with_description("Per-block fetch/decode/persist latency")
            .with_unit("ms")
            .build();

        Self {
            inner: Arc::new(Inner {
                scope_attrs: vec![
                    KeyValue::new("chain_id", chain_id),
                    KeyValue::new("contract_address", contract_address.to_string()),
                ],
                blocks_processed_total,
                events_indexed_total,
                decode_failures_total,
                rpc_errors_total,
                db_errors_total,
                reorgs_total,
                reorg_rollback_blocks_total,
                chain_latest_block,
                chain_safe_block,
                last_scanned_block,
                rpc_ms,
                block_process_ms,
            }),
        }
    }

    pub fn set_chain_position(&self, latest: u64, safe: u64, last_scanned: u64) {
        let attrs = &self.inner.scope_attrs;
        self.inner.chain_latest_block.record(latest, attrs);
        self.inner.chain_safe_block.record(safe, attrs);
        self.inner.last_scanned_block.record(last_scanned, attrs);
    }

    pub fn block_processed(&self) {
        self.inner
            .blocks_processed_total
            .add(1, &self.inner.scope_attrs);
    }

    pub fn events_indexed(&self, event_type: &'static str, count: u64) {
        if count == 0 {
            return;
        }
        let mut attrs = self.inner.scope_attrs.clone();
        attrs.push(KeyValue::new("event_type", event_type));
        self.inner.events_indexed_total.add(count, &attrs);
    }

    pub fn decode_failure(&self) {
        self.inner
            .decode_failures_total
            .add(1, &self.inner.scope_attrs);
    }

    pub fn rpc_error(&self, method: &'static str) {
        let mut attrs = self.inner.scope_attrs.clone();
        attrs.push(KeyValue::new("method", method));
        self.inner.rpc_errors_total.add(1, &attrs);
    }

    pub fn db_error(&self, op: &'static str) {
        let mut attrs = self.inner.scope_attrs.clone();
        attrs.push(KeyValue::new("op", op));
        self.inner.db_errors_total.add(1, &attrs);
    }

    pub fn reorg_detected(&self, rolled_back_blocks: u64) {
        self.inner.reorgs_total.add(1, &self.inner.scope_attrs);
        if rolled_back_blocks > 0 {
            self.inner
                .reorg_rollback_blocks_total
                .add(rolled_back_blocks, &self.inner.scope_attrs);
        }
    }

    pub fn observe_rpc_latency_ms(&self, method: &'static str, ms: u64) {
        let mut attrs = self.inner.scope_attrs.clone();
        attrs.push(KeyValue::new("method", method));
        self.inner.rpc_ms.record(ms, &attrs);
    }

    pub fn observe_block_ms(&self, ms: u64) {
        self.inner
            .block_process_ms
            .record(ms, &self.inner.scope_attrs);
    }
}
