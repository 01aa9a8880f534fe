#![no_main]

use libfuzzer_sys::fuzz_target;
use mcpgate_bridge::classify::classify_message;
use mcpgate_bridge::{Frame, JsonRpcId};

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);

    let _ = classify_message(&s);

    if let Ok(frame) = Frame::parse(&s) {
        let _ = frame.id();
        let _ = frame.method();
        let _ = frame.is_error_response();
        let _ = frame.error_message();
        let _ = frame.is_initialize_handshake();
        let _ = frame.to_line();
    }

    let _ = serde_json::from_str::<serde_json::Value>(&s)
        .ok()
        .as_ref()
        .and_then(JsonRpcId::from_value);
});
