#![no_main]
use libfuzzer_sys::fuzz_target;

use async_h1_conn::{Handler, HttpTransaction, Outbox, ServerConnection, Transport};
use http_types::StatusCode;

struct Echo;

impl Handler<HttpTransaction> for Echo {
    fn request(&mut self, txn: &mut HttpTransaction) {
        let body = txn.request_body().to_vec();
        txn.respond(StatusCode::Ok, body);
    }
}

fuzz_target!(|request: &[u8]| {
    let outbox = Outbox::new(Transport::Local);
    let mut conn = ServerConnection::<HttpTransaction, _, _>::new(outbox, Echo);
    for chunk in request.chunks(64) {
        conn.read(chunk);
        let (_, notify_count) = conn.stream_mut().take_written();
        for _ in 0..notify_count {
            conn.written();
        }
    }
    conn.closed();
});
