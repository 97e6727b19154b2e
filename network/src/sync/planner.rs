//! Request planning: splitting a block range into batched requests.

use spindle_core::types::Hash;

use crate::p2p::methods::{
    BlockRequest, Direction, FromBlock, BOOTSTRAP_REQUESTED_DATA, MAX_BLOCKS_IN_RESPONSE,
};

/// Upper bound on how many batches one bootstrap cycle may dispatch. The
/// virtual target of a cycle is therefore at most
/// `MAX_REQUESTS_ALLOWED * MAX_BLOCKS_IN_RESPONSE` blocks past the local
/// best; the observed network target bounds it further.
pub const MAX_REQUESTS_ALLOWED: usize = 40;

/// Splits `[start, target]` into ascending batch requests of at most
/// `MAX_BLOCKS_IN_RESPONSE` blocks each. The final batch may be short.
/// Returns no requests when the range is empty.
pub fn ascending_block_requests(start: u64, target: u64) -> Vec<BlockRequest> {
    if target < start {
        return Vec::new();
    }

    let span = target - start + 1;
    let cap = (MAX_REQUESTS_ALLOWED as u64) * (MAX_BLOCKS_IN_RESPONSE as u64);
    let mut remaining = span.min(cap);

    let mut requests = Vec::with_capacity(
        ((remaining + MAX_BLOCKS_IN_RESPONSE as u64 - 1) / MAX_BLOCKS_IN_RESPONSE as u64) as usize,
    );
    let mut begin = start;
    while remaining > 0 {
        let max = remaining.min(MAX_BLOCKS_IN_RESPONSE as u64);
        requests.push(BlockRequest {
            start: FromBlock::Number(begin),
            direction: Direction::Ascending,
            max: max as u32,
            requested_data: BOOTSTRAP_REQUESTED_DATA,
        });
        begin += max;
        remaining -= max;
    }
    requests
}

/// A single request walking down the chain from `hash`, used for fork
/// discovery and tip catch-up. `gap` is clamped to the protocol maximum
/// and raised to at least one block.
pub fn descending_block_request(hash: Hash, gap: u32) -> BlockRequest {
    BlockRequest {
        start: FromBlock::Hash(hash),
        direction: Direction::Descending,
        max: gap.max(1).min(MAX_BLOCKS_IN_RESPONSE),
        requested_data: BOOTSTRAP_REQUESTED_DATA,
    }
}

/// Total number of blocks a plan will deliver when fulfilled.
pub fn planned_count(requests: &[BlockRequest]) -> usize {
    requests.iter().map(|r| r.max as usize).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_range_plans_nothing() {
        assert!(ascending_block_requests(10, 9).is_empty());
    }

    #[test]
    fn test_single_block_range() {
        let plan = ascending_block_requests(5, 5);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].max, 1);
        assert_eq!(plan[0].start, FromBlock::Number(5));
        assert_eq!(plan[0].direction, Direction::Ascending);
    }

    #[test]
    fn test_plan_sum_equals_span() {
        // plan-then-fulfill: the maxes sum to the requested span
        for (start, target) in &[(1u64, 500u64), (1, 128), (100, 356), (7, 7)] {
            let plan = ascending_block_requests(*start, *target);
            assert_eq!(planned_count(&plan) as u64, target - start + 1);
        }
    }

    #[test]
    fn test_batches_step_by_response_size() {
        let plan = ascending_block_requests(1, 500);
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[0].start, FromBlock::Number(1));
        assert_eq!(plan[0].max, 128);
        assert_eq!(plan[1].start, FromBlock::Number(129));
        assert_eq!(plan[2].start, FromBlock::Number(257));
        assert_eq!(plan[3].start, FromBlock::Number(385));
        assert_eq!(plan[3].max, 116);
        for request in &plan {
            assert_eq!(request.requested_data, BOOTSTRAP_REQUESTED_DATA);
        }
    }

    #[test]
    fn test_plan_is_capped() {
        let plan = ascending_block_requests(1, 1_000_000);
        assert_eq!(plan.len(), MAX_REQUESTS_ALLOWED);
        assert_eq!(
            planned_count(&plan),
            MAX_REQUESTS_ALLOWED * MAX_BLOCKS_IN_RESPONSE as usize
        );
    }

    #[test]
    fn test_descending_request_is_clamped() {
        let hash = Hash::from_u64(95);
        let request = descending_block_request(hash, 5);
        assert_eq!(request.max, 5);
        assert_eq!(request.direction, Direction::Descending);
        assert_eq!(request.start, FromBlock::Hash(hash));

        assert_eq!(descending_block_request(hash, 1000).max, MAX_BLOCKS_IN_RESPONSE);
        assert_eq!(descending_block_request(hash, 0).max, 1);
    }
}
