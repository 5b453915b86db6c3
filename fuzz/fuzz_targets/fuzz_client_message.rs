#![no_main]

use libfuzzer_sys::fuzz_target;
use uno_session_server::protocol::ClientMessage;

fuzz_target!(|data: &[u8]| {
    // Every inbound frame goes through `from_json` before touching session
    // state; it must reject arbitrary input without panicking.
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(msg) = ClientMessage::from_json(text) {
            let _ = msg.kind();
            let _ = serde_json::to_string(&msg);
        }
    }

    let _ = serde_json::from_slice::<ClientMessage>(data);
});
