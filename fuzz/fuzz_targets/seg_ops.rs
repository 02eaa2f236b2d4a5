#![no_main]
use alloc_hater::AllocatorOp;
use libfuzzer_sys::fuzz_target;
use segalloc::DEFAULT_CAPACITY;
use segalloc_hater::SegSubject;

fuzz_target!(|ops: Vec<AllocatorOp>| {
    let subject = match SegSubject::new(DEFAULT_CAPACITY, false) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(subject);
    eval.evaluate(ops).unwrap();

    let subject = eval.into_subject();
    assert_eq!(subject.heap().consistency_check(false), 0);
});
