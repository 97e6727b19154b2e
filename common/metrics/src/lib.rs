// Copyright 2026 Spindle Authors.
// This file is part of Spindle.

// Spindle is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Spindle is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Spindle.  If not, see <http://www.gnu.org/licenses/>.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate prometheus;

use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};

lazy_static! {
    /// 1 while the node believes it is at the head of the chain, 0 while it
    /// is bootstrapping. The metric name is part of the node's observable
    /// surface and must not change.
    pub static ref SYNCER_IS_SYNCED: IntGauge = register_int_gauge!(
        "gossamer_network_syncer_is_synced",
        "whether the node is synced to the head of the chain"
    )
    .expect("metric registration");

    /// Total number of blocks imported by the sync service.
    pub static ref BLOCKS_SYNCED_TOTAL: IntCounter = register_int_counter!(
        "gossamer_network_syncer_blocks_synced_total",
        "number of blocks synced"
    )
    .expect("metric registration");

    /// Encoded size in bytes of the most recently imported block body.
    pub static ref SYNC_BLOCK_SIZE: IntGauge = register_int_gauge!(
        "gossamer_sync_block_size",
        "size of the last synced block body in bytes"
    )
    .expect("metric registration");
}

/// Renders the default registry in the Prometheus text exposition format.
pub fn gather() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("text encoding of gathered metrics");
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_metric_names() {
        SYNCER_IS_SYNCED.set(1);
        BLOCKS_SYNCED_TOTAL.inc();
        SYNC_BLOCK_SIZE.set(100);

        let exposition = gather();
        assert!(exposition.contains("gossamer_network_syncer_is_synced"));
        assert!(exposition.contains("gossamer_network_syncer_blocks_synced_total"));
        assert!(exposition.contains("gossamer_sync_block_size"));
    }
}
