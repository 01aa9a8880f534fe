#![no_main]

use libfuzzer_sys::fuzz_target;
use mcpgate_bridge::sse::SseDecoder;

fuzz_target!(|data: &[u8]| {
    let mut whole = SseDecoder::new();
    let whole_events = whole.feed(data);

    // Chunk boundaries must not change what is decoded.
    let mid = data.len() / 2;
    let mut split = SseDecoder::new();
    let mut split_events = split.feed(&data[..mid]);
    split_events.extend(split.feed(&data[mid..]));

    assert_eq!(whole_events, split_events);
});
