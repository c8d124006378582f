//! Block selection policies.
//!
//! Every policy walks the chain from head to tail looking at each block's
//! remainder (`size - usage`, so a free block offers its whole size) and
//! picks one that can hold `needed` bytes, header included.

use std::ptr::NonNull;

use tracing::trace;

use crate::{block::BlockHeader, config::Algorithm};

impl Algorithm {
    /// Looks for a block with at least `needed` bytes of remainder.
    pub(crate) fn find<I>(self, blocks: I, needed: usize) -> Option<NonNull<BlockHeader>>
    where
        I: IntoIterator<Item = NonNull<BlockHeader>>,
    {
        let found = match self {
            Algorithm::FirstFit => first_fit(blocks, needed),
            Algorithm::BestFit => best_fit(blocks, needed),
            Algorithm::WorstFit => worst_fit(blocks, needed),
        };

        trace!(algorithm = %self, needed, found = found.is_some(), "fit search");

        found
    }
}

#[inline]
fn remainder(block: NonNull<BlockHeader>) -> usize {
    // SAFETY: callers only hand us blocks of a live chain.
    unsafe { block.as_ref().remainder() }
}

/// The first block that fits.
fn first_fit<I>(blocks: I, needed: usize) -> Option<NonNull<BlockHeader>>
where
    I: IntoIterator<Item = NonNull<BlockHeader>>,
{
    blocks.into_iter().find(|&block| remainder(block) >= needed)
}

/// The block that fits most tightly. An exact fit ends the search early.
fn best_fit<I>(blocks: I, needed: usize) -> Option<NonNull<BlockHeader>>
where
    I: IntoIterator<Item = NonNull<BlockHeader>>,
{
    let mut best: Option<(NonNull<BlockHeader>, usize)> = None;

    for block in blocks {
        let left = remainder(block);

        if left == needed {
            return Some(block);
        }

        if left > needed && best.is_none_or(|(_, smallest)| left < smallest) {
            best = Some((block, left));
        }
    }

    best.map(|(block, _)| block)
}

/// The block that leaves the most room behind.
fn worst_fit<I>(blocks: I, needed: usize) -> Option<NonNull<BlockHeader>>
where
    I: IntoIterator<Item = NonNull<BlockHeader>>,
{
    let mut worst: Option<(NonNull<BlockHeader>, usize)> = None;

    for block in blocks {
        let left = remainder(block);

        if left >= needed && worst.is_none_or(|(_, largest)| left > largest) {
            worst = Some((block, left));
        }
    }

    worst.map(|(block, _)| block)
}
