#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tds_codec::{MessageAssembler, TdsCodec};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Split into packets, then reassemble messages
    let mut codec = TdsCodec::new();
    let mut src = BytesMut::from(data);
    let mut assembler = MessageAssembler::new();
    while let Ok(Some(packet)) = codec.decode(&mut src) {
        if assembler.push(packet).is_err() {
            break;
        }
    }
});
