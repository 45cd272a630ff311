//! Pure wall-clock deadline arithmetic. Timestamps are captured at object
//! creation, so reconciler restarts never reset a running deadline.

pub fn exceeded(creation_time_ms: u64, deadline_ms: u64, now_ms: u64) -> bool {
    now_ms.saturating_sub(creation_time_ms) > deadline_ms
}

/// Milliseconds until the deadline fires; zero once it has.
pub fn remaining_ms(creation_time_ms: u64, deadline_ms: u64, now_ms: u64) -> u64 {
    (creation_time_ms + deadline_ms).saturating_sub(now_ms)
}
