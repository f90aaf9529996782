use rtbroker::application::RealTimeApplication;
use rtbroker::harness::CycleHarness;
use serde_json::json;
use std::alloc::{GlobalAlloc, Layout};
use std::cell::RefCell;

thread_local! {
    static ALLOC_COUNT: RefCell<usize> = RefCell::new(0);
}

struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        ALLOC_COUNT.with(|c| *c.borrow_mut() += 1);
        unsafe { std::alloc::System.alloc(layout) }
    }
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { std::alloc::System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static A: CountingAllocator = CountingAllocator;

#[test]
fn rt_alloc_invariant() {
    let app = RealTimeApplication::from_value(json!({
        "data_sources": [{"name": "DDB", "class": "MemoryDataSource"}],
        "functions": [
            {"name": "Count", "class": "CounterGam",
             "output_signals": [{"name": "n", "data_source": "DDB", "type": "uint32",
                                 "number_of_elements": 4}]},
            {"name": "Scale", "class": "GainGam", "gain": 0.5,
             "input_signals": [{"name": "n", "data_source": "DDB", "type": "uint32",
                                "number_of_elements": 4}],
             "output_signals": [{"name": "half", "data_source": "DDB", "type": "float32",
                                 "number_of_elements": 4}]},
            {"name": "Copy", "class": "CopyGam",
             "input_signals": [{"name": "half", "data_source": "DDB", "type": "float32",
                                "number_of_elements": 4}],
             "output_signals": [{"name": "copy", "data_source": "DDB", "type": "float32",
                                 "number_of_elements": 4}]}
        ],
        "states": [{"name": "Run", "threads": [{"name": "T", "functions": ["Count", "Scale", "Copy"]}]}],
        "scheduler": {"name": "Sched", "class": "MultiThreadScheduler"}
    }))
    .unwrap();
    let mut harness = CycleHarness::for_thread(&app, "Run", "T").unwrap();
    harness.run_cycle(0).unwrap();

    ALLOC_COUNT.with(|c| *c.borrow_mut() = 0);
    for _ in 0..10_000 {
        harness.run_cycle(0).unwrap();
    }
    let count = ALLOC_COUNT.with(|c| *c.borrow());
    assert_eq!(count, 0, "cycles should not allocate");
    assert_eq!(harness.failures(), 0);
}
