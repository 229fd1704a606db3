#![no_main]

use libfuzzer_sys::fuzz_target;

use hawser_sp::ws::frame::HeadFixed;
use hawser_sp::ws::http::{Request, Response};

fuzz_target!(|data: &[u8]| {
    // Frame header decoding must never panic, whatever the bytes.
    if data.len() >= 2 {
        if let Ok(fx) = HeadFixed::decode(data[0], data[1]) {
            let need = fx.ext_len();
            if data.len() >= 2 + need {
                let ext = &data[2..2 + need];
                if fx.payload_len(ext).is_ok() && fx.masked {
                    let _ = fx.mask_key(ext);
                }
            }
        }
    }

    // Neither must the HTTP head parsers.
    let _ = Request::parse(data);
    let _ = Response::parse(data);
});
