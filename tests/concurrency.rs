use std::{slice, sync::Arc, thread};

use misfit::{Algorithm, Config, MisFit};

const THREADS: usize = 8;
const ROUNDS: usize = 300;

fn hammer(algorithm: Algorithm) {
    let allocator = Arc::new(MisFit::with_config(Config::new(algorithm)));

    let workers: Vec<_> = (0..THREADS)
        .map(|id| {
            let allocator = Arc::clone(&allocator);

            thread::spawn(move || {
                let tag = id as u8 + 1;
                let mut live = Vec::new();

                for round in 0..ROUNDS {
                    let size = 1 + (round * 37 + id * 101) % 700;
                    let ptr = allocator.allocate(size);
                    assert!(!ptr.is_null());
                    unsafe { ptr.write_bytes(tag, size) };
                    live.push((ptr, size));

                    if round % 3 == 2 {
                        let (ptr, size) = live.swap_remove(round % live.len());
                        let grown = unsafe { allocator.resize(ptr, size * 2) };
                        assert!(!grown.is_null());

                        let bytes = unsafe { slice::from_raw_parts(grown, size) };
                        assert!(bytes.iter().all(|&b| b == tag), "payload clobbered by another thread");

                        unsafe { allocator.release(grown) };
                    }
                }

                for (ptr, size) in live {
                    let bytes = unsafe { slice::from_raw_parts(ptr, size) };
                    assert!(bytes.iter().all(|&b| b == tag), "payload clobbered by another thread");
                    unsafe { allocator.release(ptr) };
                }
            })
        })
        .collect();

    // Reports taken while the workers run always see consistent regions.
    for _ in 0..20 {
        for region in allocator.snapshot() {
            assert_eq!(region.size, region.block_bytes());
        }
        thread::yield_now();
    }

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(allocator.snapshot().is_empty());
}

#[test]
fn concurrent_first_fit() {
    hammer(Algorithm::FirstFit);
}

#[test]
fn concurrent_best_fit() {
    hammer(Algorithm::BestFit);
}

#[test]
fn concurrent_worst_fit() {
    hammer(Algorithm::WorstFit);
}

#[test]
fn shared_static_allocator() {
    static ALLOCATOR: MisFit = MisFit::with_config(Config::new(Algorithm::FirstFit));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(|| {
                let ptrs: Vec<_> = (1..=64).map(|size| ALLOCATOR.zero_allocate(size, 4)).collect();
                for ptr in ptrs {
                    assert!(!ptr.is_null());
                    unsafe { ALLOCATOR.release(ptr) };
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(ALLOCATOR.snapshot().is_empty());
}
