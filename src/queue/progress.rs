pub const DEFAULT_PROGRESS_EVERY: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressTick {
    pub current: u32,
    pub total: u32,
}

/// Forwards every `every`-th engine tick plus the final one.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    every: u32,
    last_seen: Option<ProgressTick>,
    last_sent: Option<ProgressTick>,
}

impl ProgressThrottle {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            last_seen: None,
            last_sent: None,
        }
    }

    pub fn observe(&mut self, current: u32, total: u32) -> Option<ProgressTick> {
        let tick = ProgressTick { current, total };
        self.last_seen = Some(tick);
        if total == 0 {
            return None;
        }
        let due = current >= total || current % self.every == 0;
        if due && self.last_sent != Some(tick) {
            self.last_sent = Some(tick);
            return Some(tick);
        }
        None
    }

    /// Last observed tick if it was throttled away.
    pub fn flush(&mut self) -> Option<ProgressTick> {
        match self.last_seen {
            Some(tick) if self.last_sent != Some(tick) && tick.total > 0 => {
                self.last_sent = Some(tick);
                Some(tick)
            }
            _ => None,
        }
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_EVERY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_every_nth_tick_and_the_last_one() {
        let mut throttle = ProgressThrottle::new(5);
        let sent: Vec<u32> = (1..=12)
            .filter_map(|current| throttle.observe(current, 12))
            .map(|tick| tick.current)
            .collect();
        assert_eq!(sent, vec![5, 10, 12]);
        assert_eq!(throttle.flush(), None);
    }

    #[test]
    fn flush_reports_a_swallowed_final_tick() {
        let mut throttle = ProgressThrottle::new(5);
        assert_eq!(throttle.observe(3, 20), None);
        assert_eq!(
            throttle.flush(),
            Some(ProgressTick {
                current: 3,
                total: 20
            })
        );
        assert_eq!(throttle.flush(), None);
    }
}
