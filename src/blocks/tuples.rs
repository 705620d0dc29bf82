//! Tuple shapes accepted by the join blocks.
//!
//! [`JoinTuple`] and [`BatchedJoinTuple`] are implemented for tuples of two
//! to seven element types. They map each position to a typed target and
//! expose the targets to the block coordinator as type-erased participants.

use super::batched_join::{BatchedJoinCoordinator, BatchedJoinParticipant, BatchedJoinTarget};
use super::join::{JoinCoordinator, JoinParticipant, JoinTarget};
use crate::messaging::TargetBlock;
use std::sync::{Arc, Weak};

/// A tuple type a [`JoinBlock`](super::JoinBlock) can produce
pub trait JoinTuple: Sized + Send + 'static {
    /// One `Arc<JoinTarget<Ti>>` per position
    type Targets: Send + Sync + 'static;

    const ARITY: usize;

    #[doc(hidden)]
    fn create_targets(coordinator: &Weak<dyn JoinCoordinator>) -> Self::Targets;

    #[doc(hidden)]
    fn participants(targets: &Self::Targets) -> Vec<Arc<dyn JoinParticipant>>;

    /// Dequeue one item per position, or nothing if any position is empty
    #[doc(hidden)]
    fn take(targets: &Self::Targets) -> Option<Self>;
}

/// Element types a [`BatchedJoinBlock`](super::BatchedJoinBlock) collects
pub trait BatchedJoinTuple: Send + 'static {
    /// `(Vec<T1>, …, Vec<TN>)`
    type Output: Send + 'static;

    /// One `Arc<BatchedJoinTarget<Ti>>` per position
    type Targets: Send + Sync + 'static;

    const ARITY: usize;

    #[doc(hidden)]
    fn create_batched_targets(coordinator: &Weak<dyn BatchedJoinCoordinator>) -> Self::Targets;

    #[doc(hidden)]
    fn batched_participants(targets: &Self::Targets) -> Vec<Arc<dyn BatchedJoinParticipant>>;

    #[doc(hidden)]
    fn take_all(targets: &Self::Targets) -> Self::Output;

    #[doc(hidden)]
    fn complete_targets(targets: &Self::Targets);
}

macro_rules! impl_grouping_tuple {
    ($arity:expr; $($ty:ident => $idx:tt),+) => {
        impl<$($ty: Send + 'static),+> JoinTuple for ($($ty,)+) {
            type Targets = ($(Arc<JoinTarget<$ty>>,)+);

            const ARITY: usize = $arity;

            fn create_targets(coordinator: &Weak<dyn JoinCoordinator>) -> Self::Targets {
                ($(Arc::new(JoinTarget::<$ty>::new($idx, coordinator.clone())),)+)
            }

            fn participants(targets: &Self::Targets) -> Vec<Arc<dyn JoinParticipant>> {
                vec![$(Arc::clone(&targets.$idx) as Arc<dyn JoinParticipant>),+]
            }

            fn take(targets: &Self::Targets) -> Option<Self> {
                if $(targets.$idx.buffered_count() == 0)||+ {
                    return None;
                }
                Some(($(targets.$idx.pop_front()?,)+))
            }
        }

        impl<$($ty: Send + 'static),+> BatchedJoinTuple for ($($ty,)+) {
            type Output = ($(Vec<$ty>,)+);

            type Targets = ($(Arc<BatchedJoinTarget<$ty>>,)+);

            const ARITY: usize = $arity;

            fn create_batched_targets(
                coordinator: &Weak<dyn BatchedJoinCoordinator>,
            ) -> Self::Targets {
                ($(Arc::new(BatchedJoinTarget::<$ty>::new($idx, coordinator.clone())),)+)
            }

            fn batched_participants(
                targets: &Self::Targets,
            ) -> Vec<Arc<dyn BatchedJoinParticipant>> {
                vec![$(Arc::clone(&targets.$idx) as Arc<dyn BatchedJoinParticipant>),+]
            }

            fn take_all(targets: &Self::Targets) -> Self::Output {
                ($(targets.$idx.take_all(),)+)
            }

            fn complete_targets(targets: &Self::Targets) {
                $(targets.$idx.complete();)+
            }
        }
    };
}

impl_grouping_tuple!(2; A => 0, B => 1);
impl_grouping_tuple!(3; A => 0, B => 1, C => 2);
impl_grouping_tuple!(4; A => 0, B => 1, C => 2, D => 3);
impl_grouping_tuple!(5; A => 0, B => 1, C => 2, D => 3, E => 4);
impl_grouping_tuple!(6; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);
impl_grouping_tuple!(7; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_JOIN_ARITY;

    #[test]
    fn test_arities_cover_two_through_max() {
        assert_eq!(<(u8, u8) as JoinTuple>::ARITY, 2);
        assert_eq!(<(u8, u8, u8, u8) as BatchedJoinTuple>::ARITY, 4);
        assert_eq!(
            <(u8, u8, u8, u8, u8, u8, u8) as JoinTuple>::ARITY,
            MAX_JOIN_ARITY
        );
        assert_eq!(
            <(u8, u8, u8, u8, u8, u8, u8) as BatchedJoinTuple>::ARITY,
            MAX_JOIN_ARITY
        );
    }
}
