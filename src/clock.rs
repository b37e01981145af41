use std::sync::atomic::{AtomicI64, Ordering};

use crate::model::Ms;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Source of "now" for the engine. Manual clocks only move when told to.
#[derive(Debug)]
pub enum Clock {
    System,
    Manual(AtomicI64),
}

impl Clock {
    pub fn manual(start: Ms) -> Self {
        Clock::Manual(AtomicI64::new(start))
    }

    pub fn now(&self) -> Ms {
        match self {
            Clock::System => now_ms(),
            Clock::Manual(t) => t.load(Ordering::SeqCst),
        }
    }

    /// No-op on the system clock.
    pub fn advance(&self, by: Ms) {
        if let Clock::Manual(t) = self {
            t.fetch_add(by, Ordering::SeqCst);
        }
    }

    pub fn set(&self, to: Ms) {
        if let Clock::Manual(t) = self {
            t.store(to, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = Clock::manual(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now(), 1_500);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }

    #[test]
    fn system_clock_is_recent() {
        // after 2020-01-01
        assert!(Clock::System.now() > 1_577_836_800_000);
    }
}
