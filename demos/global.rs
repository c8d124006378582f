//! Runs a small program with the allocator serving the whole process. Pick
//! the policy with `ALLOCATOR_ALGORITHM` and poison fresh memory with
//! `ALLOCATOR_SCRIBBLE=1`.

use misfit::MisFit;
use std::thread;

#[global_allocator]
static ALLOCATOR: MisFit = MisFit::new();

fn main() {
    // Box example
    let val_box = Box::new(22);
    println!("Box Value: {}, At: {:p}", val_box, val_box);

    // Vec example
    let mut v = Vec::new();
    for i in 0..5 {
        v.push(i * 10);
        println!("Added {}; Capacity: {}; At: {:p}", v[i], v.capacity(), v.as_ptr());
    }

    // String example
    let msg = String::from("Heap Testing");
    println!("\nString '{}' - At: {:p}", msg, msg.as_ptr());

    // Reuse example: with first fit the second box lands where the first was.
    let p1 = Box::new(2.22);
    let addr_p1 = format!("{:p}", p1);
    drop(p1);

    let p2 = Box::new(2.22);
    let addr_p2 = format!("{:p}", p2);
    println!("P1 was at {addr_p1}, P2 is at {addr_p2}");

    // Thread example
    let workers: Vec<_> = (0..4)
        .map(|i| thread::spawn(move || (0..100).map(|n| n * i).collect::<Vec<u64>>().len()))
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    ALLOCATOR.print_memory().unwrap();
}
