//! Proptest strategies for grouping scenarios.

use proptest::prelude::*;

/// Batch size and the number of items offered
pub fn batch_scenario_strategy() -> impl Strategy<Value = (usize, usize)> {
    (1usize..=8, 0usize..=60)
}

/// Interleaved offers to a two-input join: (position, value)
pub fn join_interleaving_strategy() -> impl Strategy<Value = Vec<(usize, u32)>> {
    prop::collection::vec((0usize..2, any::<u32>()), 0..40)
}

/// Bounded capacity, batch size and item count for a bounded batch
pub fn bounded_batch_strategy() -> impl Strategy<Value = (usize, usize, usize)> {
    (1usize..=6).prop_flat_map(|batch_size| {
        (batch_size..=batch_size * 3, Just(batch_size), 0usize..=30)
            .prop_map(|(capacity, batch_size, items)| (capacity, batch_size, items))
    })
}

/// Batch size and a per-target item split for a batched join
pub fn batched_join_strategy() -> impl Strategy<Value = (usize, Vec<(usize, u16)>)> {
    (1usize..=6, prop::collection::vec((0usize..2, any::<u16>()), 0..40))
}
