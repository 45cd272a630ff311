use std::time::{SystemTime, UNIX_EPOCH};

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}

/// Like `Option::inspect` but for the `None` arm.
pub trait OptionInspectNone<T> {
    fn inspect_none(self, f: impl FnOnce()) -> Option<T>;
}

impl<T> OptionInspectNone<T> for Option<T> {
    fn inspect_none(self, f: impl FnOnce()) -> Option<T> {
        if self.is_none() {
            f();
        }
        self
    }
}
