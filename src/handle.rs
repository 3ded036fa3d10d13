//! Container handle generation.
//!
//! Produces an 11-character base-32 handle. The length is
//! load-bearing: handles are embedded in a kernel network interface
//! name with a 2-character prefix and suffix under the 15-character
//! `IFNAMSIZ` ceiling, so every handle must be exactly 11 bytes. A
//! monotonic counter seeded from wall-clock microseconds is encoded 5
//! bits at a time (most significant chunk first) using the alphabet
//! `0-9a-v`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
const HANDLE_LEN: usize = 11;

static COUNTER: AtomicI64 = AtomicI64::new(0);
static INIT: std::sync::Once = std::sync::Once::new();

fn seed() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn ensure_seeded() {
    INIT.call_once(|| {
        COUNTER.store(seed(), Ordering::SeqCst);
    });
}

/// Generate the next handle. Every call returns a distinct, exactly
/// 11-character string for the lifetime of the process.
pub fn next_handle() -> String {
    ensure_seeded();
    let id = COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
    encode(id)
}

fn encode(id: i64) -> String {
    let mut s = String::with_capacity(HANDLE_LEN);
    for i in 0..HANDLE_LEN as i64 {
        let shift = 55 - (i + 1) * 5;
        let chunk = ((id >> shift) & 31) as usize;
        s.push(ALPHABET[chunk] as char);
    }
    s
}
