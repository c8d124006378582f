//! Runs with the allocator serving the whole test process. The harness is
//! off: `main` is the test, and any failure aborts or panics the binary.

use std::{
    alloc::{Layout, alloc, dealloc},
    collections::HashMap,
    sync::mpsc,
    thread,
};

use misfit::MisFit;

#[global_allocator]
static ALLOCATOR: MisFit = MisFit::new();

/// Channels allocate their blocks with cache line padding, well above the
/// allocator's own alignment.
fn channels_and_threads() {
    let (tx, rx) = mpsc::channel::<Vec<u64>>();

    let producers: Vec<_> = (0..4u64)
        .map(|id| {
            let tx = tx.clone();
            thread::spawn(move || {
                for round in 0..200 {
                    tx.send((0..round % 50).map(|n| n * id).collect()).unwrap();
                }
            })
        })
        .collect();
    drop(tx);

    let received: usize = rx.iter().map(|batch| batch.len()).sum();
    for producer in producers {
        producer.join().unwrap();
    }

    assert_eq!(4 * (0..200).map(|round| round % 50).sum::<usize>(), received);

    let (tx, rx) = mpsc::sync_channel::<String>(2);
    let echo = thread::spawn(move || rx.iter().map(|s| s.len()).sum::<usize>());
    for word in ["region", "block", "chain"] {
        tx.send(word.repeat(3)).unwrap();
    }
    drop(tx);
    assert_eq!(3 * 16, echo.join().unwrap());
}

fn collections() {
    let mut names: HashMap<String, Vec<u32>> = HashMap::new();
    for n in 0..2_000u32 {
        names.entry(format!("key-{}", n % 97)).or_default().push(n);
    }
    assert_eq!(97, names.len());

    let mut v: Vec<u64> = Vec::new();
    for n in 0..50_000 {
        v.push(n);
    }
    v.truncate(10);
    v.shrink_to_fit();
    assert_eq!((0..10).collect::<Vec<_>>(), v);
}

fn strict_layouts() {
    for align in [16, 64, 128, 4096] {
        let layout = Layout::from_size_align(300, align).unwrap();
        unsafe {
            let ptr = alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(0, ptr as usize % align);
            ptr.write_bytes(0x5a, layout.size());
            dealloc(ptr, layout);
        }
    }
}

fn main() {
    channels_and_threads();
    collections();
    strict_layouts();

    ALLOCATOR.print_memory().unwrap();
    println!("global allocator: ok");
}
