#![no_main]

use libfuzzer_sys::fuzz_target;
use weft_core::buffer::BufferPool;
use weft_core::framing::{Messages, Reassembler, TERMINATOR};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    // First byte picks the buffer size and the receive piece size
    let buffer_size = usize::from(data[0] % 32) + 1;
    let piece = usize::from(data[0] / 32) + 1;
    let stream = &data[1..];

    let pool = BufferPool::new(buffer_size, 2);
    let mut reassembler = Reassembler::new(&pool);
    let mut messages = Messages::new();
    for chunk in stream.chunks(piece) {
        reassembler.feed(chunk, &mut messages).unwrap();
    }

    // Whatever the split, the messages are exactly the terminated segments
    let expected: Vec<&[u8]> = stream.split(|&b| b == TERMINATOR).collect();
    let finished = expected.len() - 1;
    assert_eq!(messages.len(), finished);
    for (message, segment) in messages.iter().zip(&expected) {
        assert_eq!(&message[..], *segment);
    }
    assert_eq!(reassembler.pending_len(), expected[finished].len());

    drop(reassembler);
    assert_eq!(pool.outstanding(), 0);
});
