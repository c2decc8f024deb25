//! Multi-threaded integration test.

use tierpool::MemoryPool;

fn lcg(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
    *state
}

#[test]
fn test_mixed_stress() {
    let num_threads = 8;
    let ops_per_thread = 5_000;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            std::thread::spawn(move || {
                let mut rng = 0x5EED_0000u64 + t as u64;
                // (ptr, size, fill byte) for every live block.
                let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

                for op in 0..ops_per_thread {
                    let r = lcg(&mut rng);
                    if r % 2 == 0 || live.is_empty() {
                        let size = 1 + (r >> 8) as usize % 512;
                        let p = MemoryPool::allocate(size);
                        assert!(!p.is_null());
                        let fill = (op & 0xFF) as u8;
                        unsafe { p.write_bytes(fill, size) };
                        live.push((p, size, fill));
                    } else {
                        let idx = (r >> 16) as usize % live.len();
                        let (p, size, fill) = live.swap_remove(idx);
                        unsafe {
                            // Contents survive while the block is live.
                            assert_eq!(*p, fill);
                            assert_eq!(*p.add(size - 1), fill);
                            MemoryPool::deallocate(p, size);
                        }
                    }
                }

                // Terminate with zero in-flight allocations.
                for (p, size, fill) in live {
                    unsafe {
                        assert_eq!(*p, fill);
                        MemoryPool::deallocate(p, size);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn test_cross_thread_free() {
    // Allocate on producer threads, free on the consumer.
    let num_threads = 4;
    let items_per_thread = 500;
    let size = 64usize;

    let (tx, rx) = std::sync::mpsc::channel::<Vec<usize>>();

    let producers: Vec<_> = (0..num_threads)
        .map(|t| {
            let tx = tx.clone();
            std::thread::spawn(move || {
                let items: Vec<usize> = (0..items_per_thread)
                    .map(|i| {
                        let p = MemoryPool::allocate(size);
                        assert!(!p.is_null());
                        unsafe { p.write_bytes((t * 31 + i % 97) as u8, size) };
                        p as usize
                    })
                    .collect();
                tx.send(items).unwrap();
            })
        })
        .collect();

    drop(tx);

    let mut total = 0;
    for items in rx {
        total += items.len();
        for addr in items {
            unsafe { MemoryPool::deallocate(addr as *mut u8, size) };
        }
    }

    for p in producers {
        p.join().unwrap();
    }

    assert_eq!(total, num_threads * items_per_thread);
}

#[test]
fn test_per_thread_lifo() {
    // Each thread has its own front end, so the LIFO law holds on
    // every thread independently and concurrently.
    let handles: Vec<_> = (0..8)
        .map(|_| {
            std::thread::spawn(|| {
                for _ in 0..200 {
                    let p = MemoryPool::allocate(48);
                    assert!(!p.is_null());
                    unsafe { MemoryPool::deallocate(p, 48) };
                    let q = MemoryPool::allocate(48);
                    assert_eq!(q, p);
                    unsafe { MemoryPool::deallocate(q, 48) };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn test_mixed_sizes_multithreaded() {
    let handles: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(|| {
                let mut live: Vec<(*mut u8, usize)> = Vec::new();
                for i in 0..200 {
                    let size = match i % 5 {
                        0 => 8,
                        1 => 64,
                        2 => 512,
                        3 => 4096,
                        _ => 16384,
                    };
                    let p = MemoryPool::allocate(size);
                    assert!(!p.is_null());
                    live.push((p, size));
                    if live.len() > 50 {
                        for (p, size) in live.drain(..25) {
                            unsafe { MemoryPool::deallocate(p, size) };
                        }
                    }
                }
                for (p, size) in live {
                    unsafe { MemoryPool::deallocate(p, size) };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}
