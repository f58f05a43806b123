#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::Token;

fuzz_target!(|data: &[u8]| {
    let mut buf = data;
    while let Ok((_, used)) = Token::decode(buf) {
        if used == 0 || used > buf.len() {
            panic!("token decode reported {used} bytes of {}", buf.len());
        }
        buf = &buf[used..];
    }
});
