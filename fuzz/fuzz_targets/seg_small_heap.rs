#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use segalloc_hater::SegSubject;

const MAX_CAPACITY: usize = 1 << 14;

#[derive(Clone, Debug)]
struct Args {
    capacity: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let capacity = usize::arbitrary(un)? % MAX_CAPACITY;
        let ops = Vec::arbitrary(un)?;

        Ok(Args { capacity, ops })
    }
}

fuzz_target!(|args: Args| {
    let Args { capacity, ops } = args;

    // Capacities too small for the heap sentinels are rejected up front.
    let subject = match SegSubject::new(capacity, true) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(subject);
    eval.evaluate(ops).unwrap();
});
