//! Walks through the allocator's block life cycle with a private allocator
//! instance, printing the layout after each step. Run with
//! `RUST_LOG=trace` to see every split and region mapping.

use misfit::{Algorithm, Config, MisFit};
use tracing_subscriber::EnvFilter;

fn step(allocator: &MisFit, title: &str) {
    println!("\n== {title}");
    allocator.print_memory().unwrap();
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let algorithm = std::env::args()
        .nth(1)
        .map(|name| name.parse::<Algorithm>())
        .transpose()
        .unwrap_or_else(|error| {
            eprintln!("{error}");
            std::process::exit(2);
        })
        .unwrap_or_default();

    let allocator = MisFit::with_config(Config::new(algorithm));
    println!("algorithm: {algorithm}");

    let a = allocator.allocate_named(100, "a");
    let b = allocator.allocate_named(50, "b");
    let c = allocator.allocate_named(300, "c");
    step(&allocator, "three allocations share one region");

    unsafe { allocator.release(a) };
    step(&allocator, "a released, its block stays in the chain");

    let d = allocator.allocate_named(40, "d");
    step(&allocator, "d reuses free room");

    let big = allocator.allocate_named(3 * 4096, "big");
    step(&allocator, "big maps its own region");

    let c = unsafe { allocator.resize(c, 8000) };
    step(&allocator, "c outgrew its block and moved");

    for ptr in [b, c, d, big] {
        unsafe { allocator.release(ptr) };
    }
    step(&allocator, "everything released, every region unmapped");
}
