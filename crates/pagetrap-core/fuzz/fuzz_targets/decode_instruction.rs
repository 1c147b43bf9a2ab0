#![no_main]

use libfuzzer_sys::fuzz_target;
use pagetrap_core::{Decoder, OpKind, MAX_INSTRUCTION_LENGTH};

fuzz_target!(|data: &[u8]| {
    let op = Decoder::decode(data);

    if op.kind == OpKind::None {
        assert_eq!(op.length, 0);
        return;
    }

    let length = usize::from(op.length);
    assert!(length > 0);
    assert!(length <= data.len());
    assert!(length <= MAX_INSTRUCTION_LENGTH);
    assert!(matches!(op.size, 1 | 2 | 4 | 8 | 16 | 32));
});
