//! Wrapping 32-bit id counters.
//!
//! Job ids, subscription ids and extranonce1 values are all 32-bit counters
//! rendered as eight lowercase hex digits. Each counter is owned by whatever
//! assigns the ids (the scheduler for jobs, the server for sessions).
//!
//! After 2^32 assignments the counter wraps. An id that is still in use at
//! that point (a live session, a job still in the valid set) is skipped, so
//! two live things never share an id.

#[derive(Debug, Clone, Default)]
pub struct IdCounter {
    last: u32,
}

impl IdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter whose next id is `first`.
    pub fn starting_at(first: u32) -> Self {
        Self {
            last: first.wrapping_sub(1),
        }
    }

    /// Next id as a raw value, skipping any for which `in_use` is true.
    pub fn next(&mut self, in_use: impl Fn(u32) -> bool) -> u32 {
        // The skip loop is bounded so a pathological `in_use` cannot hang
        // the caller; in practice it runs once.
        for _ in 0..=u32::MAX {
            self.last = self.last.wrapping_add(1);
            if !in_use(self.last) {
                break;
            }
        }
        self.last
    }

    /// Next id as eight hex digits, skipping ids for which `in_use` is true.
    pub fn next_hex(&mut self, in_use: impl Fn(&str) -> bool) -> String {
        let id = self.next(|n| in_use(&to_hex(n)));
        to_hex(id)
    }
}

pub fn to_hex(n: u32) -> String {
    format!("{:08x}", n)
}
