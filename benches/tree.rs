//! Benchmarks for `BwTree` using Divan.
//!
//! Run with: `cargo bench --bench tree`

use bwtree::{BwTree, BwTreeConfig};
use divan::{Bencher, black_box};

fn main() {
    divan::main();
}

fn default_tree() -> BwTree<u64, u64> {
    BwTree::new(BwTreeConfig::default())
}

fn populated(keys: u64) -> BwTree<u64, u64> {
    let tree = default_tree();
    for k in 0..keys {
        let _ = tree.insert(k, k);
    }
    tree
}

// =============================================================================
// Construction
// =============================================================================

#[divan::bench_group]
mod construction {
    use super::{BwTree, BwTreeConfig, default_tree};

    #[divan::bench]
    fn new_default_config() -> BwTree<u64, u64> {
        default_tree()
    }

    #[divan::bench]
    fn new_small_table() -> BwTree<u64, u64> {
        BwTree::new(BwTreeConfig {
            mapping_table_slots: 1 << 10,
            ..BwTreeConfig::default()
        })
    }
}

// =============================================================================
// Insert Operations
// =============================================================================

#[divan::bench_group]
mod insert {
    use super::{Bencher, black_box, default_tree};

    #[divan::bench]
    fn insert_sequential_1k(bencher: Bencher) {
        bencher.with_inputs(default_tree).bench_local_values(|tree| {
            for k in 0..1000u64 {
                let _ = tree.insert(black_box(k), black_box(k));
            }
            tree
        });
    }

    #[divan::bench]
    fn insert_shuffled_1k(bencher: Bencher) {
        // A fixed multiplicative stride scatters keys without rand.
        bencher.with_inputs(default_tree).bench_local_values(|tree| {
            for i in 0..1000u64 {
                let k = i.wrapping_mul(0x9E37_79B9_7F4A_7C15);
                let _ = tree.insert(black_box(k), black_box(i));
            }
            tree
        });
    }
}

// =============================================================================
// Lookup Operations
// =============================================================================

#[divan::bench_group]
mod lookup {
    use super::{Bencher, black_box, populated};

    #[divan::bench]
    fn lookup_hit(bencher: Bencher) {
        let tree = populated(10_000);
        let mut k = 0u64;

        bencher.bench_local(|| {
            k = (k + 7919) % 10_000;
            black_box(tree.lookup(&k))
        });
    }

    #[divan::bench]
    fn lookup_miss(bencher: Bencher) {
        let tree = populated(10_000);

        bencher.bench_local(|| black_box(tree.lookup(&u64::MAX)));
    }
}

// =============================================================================
// Scan Operations
// =============================================================================

#[divan::bench_group]
mod scan {
    use super::{Bencher, black_box, populated};

    #[divan::bench]
    fn scan_full_10k(bencher: Bencher) {
        let tree = populated(10_000);

        bencher.bench_local(|| black_box(tree.scan(..).count()));
    }

    #[divan::bench]
    fn scan_window_100(bencher: Bencher) {
        let tree = populated(10_000);
        let mut lo = 0u64;

        bencher.bench_local(|| {
            lo = (lo + 997) % 9900;
            black_box(tree.scan(lo..lo + 100).count())
        });
    }
}
