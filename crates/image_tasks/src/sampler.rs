use anyhow::{ensure, Result};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashSet;

/// A `Sampler` defines the order in which a dataset is visited.
///
/// `iter(epoch)` returns the sequence for that epoch. Random samplers derive
/// their RNG from `base_seed + epoch`, so every epoch is shuffled differently
/// but reproducibly.
pub trait Sampler: Send + Sync {
    type Item: Send + Sync;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = Self::Item> + Send + '_>;
}

impl<S> Sampler for Box<S>
where
    S: Sampler + ?Sized,
{
    type Item = S::Item;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = Self::Item> + Send + '_> {
        (**self).iter(epoch)
    }
}

/// ============================================================================
/// Yields indices sequentially in order `(0,1,2,...,dataset_size-1)`.
///
/// ```ignore
/// let sampler = SequentialSampler::new(5);
/// let indices: Vec<_> = sampler.iter(0).collect();
/// assert_eq!(indices, vec![0, 1, 2, 3, 4]);
/// ```
#[derive(Debug, Clone)]
pub struct SequentialSampler {
    dataset_size: usize,
}

impl SequentialSampler {
    pub fn new(dataset_size: usize) -> Self {
        Self { dataset_size }
    }
}

impl Sampler for SequentialSampler {
    type Item = usize;

    fn iter(&self, _epoch: usize) -> Box<dyn Iterator<Item = usize> + Send + '_> {
        Box::new(0..self.dataset_size)
    }
}

/// ============================================================================
/// Random uniform sampling over `0..dataset_size`, with optional replacement.
///
/// # Arguments:
/// - `dataset_size`: Total number of samples in a dataset.
/// - `replacement`: If `true`, each draw is independent and indices may repeat.
/// - `num_samples`: Number of draws, defaults to `dataset_size`. Without
///   replacement it must not exceed `dataset_size`.
/// - `base_seed`: Base RNG seed, combined with the epoch.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    dataset_size: usize,
    replacement: bool,
    num_samples: usize,
    base_seed: u64,
}

impl RandomSampler {
    pub fn new(
        dataset_size: usize,
        replacement: bool,
        num_samples: Option<usize>,
        base_seed: u64,
    ) -> Result<Self> {
        let num_samples = num_samples.unwrap_or(dataset_size);
        if replacement {
            ensure!(
                dataset_size > 0,
                "Cannot sample with replacement from an empty dataset"
            );
        } else {
            ensure!(
                num_samples <= dataset_size,
                "num_samples ({}) exceeds dataset size ({}) without replacement",
                num_samples,
                dataset_size
            );
        }

        Ok(Self {
            dataset_size,
            replacement,
            num_samples,
            base_seed,
        })
    }
}

#[inline]
fn derive_rng_for_epoch(base_seed: u64, epoch: usize) -> StdRng {
    StdRng::seed_from_u64(base_seed.wrapping_add(epoch as u64))
}

impl Sampler for RandomSampler {
    type Item = usize;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = usize> + Send + '_> {
        let mut rng = derive_rng_for_epoch(self.base_seed, epoch);
        if self.replacement {
            Box::new((0..self.num_samples).map(move |_| rng.random_range(0..self.dataset_size)))
        } else {
            let mut indices: Vec<_> = (0..self.dataset_size).collect();
            indices.shuffle(&mut rng);
            indices.truncate(self.num_samples);
            Box::new(indices.into_iter())
        }
    }
}

/// ============================================================================
/// Shuffles a fixed subset of indices each epoch, without replacement.
///
/// ```ignore
/// let sampler = SubsetRandomSampler::new(1000, (10..20).collect(), 42)?;
/// let order0: Vec<_> = sampler.iter(0).collect(); // a permutation of 10..19
/// ```
#[derive(Debug, Clone)]
pub struct SubsetRandomSampler {
    indices: Vec<usize>,
    base_seed: u64,
}

impl SubsetRandomSampler {
    pub fn new(dataset_size: usize, indices: Vec<usize>, base_seed: u64) -> Result<Self> {
        ensure!(!indices.is_empty(), "Indices must not be empty");

        let mut seen_indices = HashSet::with_capacity(indices.len());
        for &index in &indices {
            ensure!(
                index < dataset_size,
                "Index {} out of bounds for dataset of size {}",
                index,
                dataset_size,
            );
            ensure!(
                seen_indices.insert(index),
                "Duplicate index {} found in SubsetRandomSampler",
                index
            );
        }
        Ok(Self { indices, base_seed })
    }
}

impl Sampler for SubsetRandomSampler {
    type Item = usize;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = usize> + Send + '_> {
        let mut rng = derive_rng_for_epoch(self.base_seed, epoch);
        let mut shuffled = self.indices.clone();
        shuffled.shuffle(&mut rng);
        Box::new(shuffled.into_iter())
    }
}

/// ============================================================================
/// Groups the output of another sampler into mini-batches.
///
/// If `drop_last` is `true`, a final mini-batch smaller than `batch_size` is
/// discarded.
///
/// ```ignore
/// let batch_sampler = BatchSampler::new(SequentialSampler::new(1000), 32, false)?;
/// for mini_batch in batch_sampler.iter(0) {
///     println!("Batch size: {}", mini_batch.len());
/// }
/// ```
#[derive(Debug, Clone)]
pub struct BatchSampler<S> {
    sampler: S,
    batch_size: usize,
    drop_last: bool,
}

impl<S: Sampler> BatchSampler<S> {
    pub fn new(sampler: S, batch_size: usize, drop_last: bool) -> Result<Self> {
        ensure!(
            batch_size > 0,
            "batch_size must be > 0, but got batch_size={}",
            batch_size
        );
        Ok(Self {
            sampler,
            batch_size,
            drop_last,
        })
    }
}

impl<S: Sampler> Sampler for BatchSampler<S> {
    type Item = Vec<S::Item>;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = Self::Item> + Send + '_> {
        let mut sampler_iter = self.sampler.iter(epoch);
        let batch_size = self.batch_size;
        let drop_last = self.drop_last;

        Box::new(std::iter::from_fn(move || {
            let mini_batch: Vec<_> = sampler_iter.by_ref().take(batch_size).collect();
            if mini_batch.len() == batch_size || (!drop_last && !mini_batch.is_empty()) {
                Some(mini_batch)
            } else {
                None
            }
        }))
    }
}

/// Splits `0..len` into disjoint `(train, val)` index sets.
///
/// The validation set holds `round(len * val_split)` indices drawn with a
/// seeded shuffle. Both sides must end up non-empty. Each side is returned
/// in ascending order so the split does not depend on iteration order.
pub fn split_indices(len: usize, val_split: f64, seed: u64) -> Result<(Vec<usize>, Vec<usize>)> {
    ensure!(
        val_split > 0.0 && val_split < 1.0,
        "val_split should be a float in (0, 1), got {}",
        val_split
    );
    let val_len = (len as f64 * val_split).round() as usize;
    ensure!(
        val_len > 0 && val_len < len,
        "val_split={} leaves an empty split for a dataset of {} samples",
        val_split,
        len
    );

    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));
    let mut val = indices.split_off(len - val_len);
    indices.sort_unstable();
    val.sort_unstable();
    Ok((indices, val))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_sampler() {
        let sampler = SequentialSampler::new(4);
        assert_eq!(sampler.iter(0).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(sampler.iter(9).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_random_sampler_is_permutation_per_epoch() -> Result<()> {
        let sampler = RandomSampler::new(20, false, None, 7)?;
        let e0: Vec<_> = sampler.iter(0).collect();
        let e1: Vec<_> = sampler.iter(1).collect();

        let mut sorted = e0.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
        assert_eq!(e0, sampler.iter(0).collect::<Vec<_>>());
        assert_ne!(e0, e1);
        Ok(())
    }

    #[test]
    fn test_random_sampler_validation() {
        assert!(RandomSampler::new(3, false, Some(4), 0).is_err());
        assert!(RandomSampler::new(0, true, Some(4), 0).is_err());
        assert!(RandomSampler::new(0, false, None, 0).is_ok());
    }

    #[test]
    fn test_replacement_stays_in_range() -> Result<()> {
        let sampler = RandomSampler::new(3, true, Some(50), 1)?;
        let draws: Vec<_> = sampler.iter(0).collect();
        assert_eq!(draws.len(), 50);
        assert!(draws.iter().all(|&i| i < 3));
        Ok(())
    }

    #[test]
    fn test_subset_sampler() -> Result<()> {
        let sampler = SubsetRandomSampler::new(10, vec![2, 4, 6], 3)?;
        let mut drawn: Vec<_> = sampler.iter(0).collect();
        drawn.sort();
        assert_eq!(drawn, vec![2, 4, 6]);
        assert!(SubsetRandomSampler::new(10, vec![2, 2], 3).is_err());
        assert!(SubsetRandomSampler::new(3, vec![5], 3).is_err());
        Ok(())
    }

    #[test]
    fn test_batch_sampler_drop_last() -> Result<()> {
        let keep = BatchSampler::new(SequentialSampler::new(5), 2, false)?;
        assert_eq!(
            keep.iter(0).collect::<Vec<_>>(),
            vec![vec![0, 1], vec![2, 3], vec![4]]
        );
        let drop = BatchSampler::new(SequentialSampler::new(5), 2, true)?;
        assert_eq!(drop.iter(0).count(), 2);
        assert!(BatchSampler::new(SequentialSampler::new(5), 0, true).is_err());
        Ok(())
    }

    #[test]
    fn test_split_indices() -> Result<()> {
        let (train, val) = split_indices(10, 0.25, 42)?;
        // round(2.5) == 3
        assert_eq!(val.len(), 3);
        assert_eq!(train.len(), 7);
        let all: HashSet<_> = train.iter().chain(&val).copied().collect();
        assert_eq!(all.len(), 10);
        assert_eq!(split_indices(10, 0.25, 42)?, (train, val));

        assert!(split_indices(10, 0.0, 0).is_err());
        assert!(split_indices(10, 1.0, 0).is_err());
        assert!(split_indices(3, 0.1, 0).is_err());
        assert!(split_indices(2, 0.9, 0).is_err());
        Ok(())
    }
}
