//! Thread-local worker identity and RNG.
//!
//! Random transforms draw from the worker RNG so that a seeded loader yields
//! the same augmentations run after run, regardless of thread scheduling.

use rand::rngs::StdRng;
use rand::Rng as _;
use rand::SeedableRng;
use std::cell::RefCell;

thread_local! {
    /// Index of the current worker thread (0 on the main thread).
    pub static WORKER_ID: RefCell<usize> = const { RefCell::new(0) };

    /// RNG seeded per worker and epoch. `None` outside a loader.
    pub static WORKER_RNG: RefCell<Option<StdRng>> = const { RefCell::new(None) };
}

/// RNG for one worker and epoch.
/// Seed formula: base_seed + (epoch << 32) + worker_id
pub fn worker_rng(worker_id: usize, epoch: usize, base_seed: u64) -> StdRng {
    let seed = base_seed
        .wrapping_add((epoch as u64) << 32)
        .wrapping_add(worker_id as u64);
    StdRng::seed_from_u64(seed)
}

/// Seeds the current thread's RNG.
pub fn init_worker_rng(worker_id: usize, epoch: usize, base_seed: u64) {
    WORKER_RNG.with(|rng| *rng.borrow_mut() = Some(worker_rng(worker_id, epoch, base_seed)))
}

/// Runs `f` with `rng` installed as the thread's worker RNG, then takes it
/// back with whatever state `f` left it in. The previous RNG is restored.
pub fn with_worker_rng<T>(rng: &mut Option<StdRng>, f: impl FnOnce() -> T) -> T {
    let previous = WORKER_RNG.with(|cell| cell.replace(rng.take()));
    let out = f();
    *rng = WORKER_RNG.with(|cell| cell.replace(previous));
    out
}

/// Random bool from the worker RNG, or the thread RNG outside a loader.
pub fn worker_gen_bool(p: f64) -> bool {
    WORKER_RNG.with(|rng| match rng.borrow_mut().as_mut() {
        Some(rng) => rng.random_bool(p),
        None => rand::rng().random_bool(p),
    })
}

pub fn current_worker_id() -> usize {
    WORKER_ID.with(|id| *id.borrow())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_same_seed_same_draws() {
        let draw = |worker, epoch| {
            init_worker_rng(worker, epoch, 42);
            (0..32).map(|_| worker_gen_bool(0.5)).collect::<Vec<_>>()
        };
        assert_eq!(draw(0, 0), draw(0, 0));
        assert_ne!(draw(0, 0), draw(1, 0));
        assert_ne!(draw(0, 0), draw(0, 1));
    }

    #[test]
    fn test_installed_rng_is_restored() {
        init_worker_rng(0, 0, 5);
        let outer_first = worker_gen_bool(0.5);

        let mut inner = Some(worker_rng(9, 0, 5));
        let inside = with_worker_rng(&mut inner, || (0..16).map(|_| worker_gen_bool(0.5)).collect::<Vec<_>>());
        let mut expected = worker_rng(9, 0, 5);
        assert_eq!(inside, (0..16).map(|_| expected.random_bool(0.5)).collect::<Vec<_>>());
        // The taken-back RNG continues where it stopped.
        assert_eq!(inner.as_mut().map(|r| r.random_bool(0.5)), Some(expected.random_bool(0.5)));

        // The outer stream is untouched.
        let mut outer = worker_rng(0, 0, 5);
        assert_eq!(outer.random_bool(0.5), outer_first);
        assert_eq!(worker_gen_bool(0.5), outer.random_bool(0.5));
    }
}
