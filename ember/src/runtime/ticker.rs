use bitflags::bitflags;

/// Counts scheduler polls. Each advance asks a policy which maintenance the
/// poll owes.
#[derive(Debug, Default)]
pub(crate) struct Ticker {
    count: u64,
}

impl Ticker {
    /// Moves to the next tick and returns its number along with the events
    /// `policy` raised for it.
    pub(crate) fn advance<P: TickerData>(
        &mut self,
        ctx: &P::Context,
        policy: &mut P,
    ) -> (u64, TickerEvents) {
        self.count = self.count.wrapping_add(1);
        (self.count, policy.update_and_check(ctx, self.count))
    }
}

/// Maintenance policy driven by a [`Ticker`]. Keeps the decision apart from
/// the counting.
pub(crate) trait TickerData {
    type Context;

    fn update_and_check(&mut self, ctx: &Self::Context, tick: u64) -> TickerEvents;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u16 {
        /// Fold cross-thread frees back into their chunks.
        const RECLAIM_MEMORY = 1;

        /// Resume waits whose deadline passed.
        const RESUME_WAITS = 1 << 1;

        /// Drain jobs queued by an inline pool.
        const RUN_INLINE = 1 << 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Raises `RECLAIM_MEMORY` every `every` ticks.
    struct EveryN {
        every: u64,
        seen: Vec<u64>,
    }

    impl TickerData for EveryN {
        type Context = ();

        fn update_and_check(&mut self, _ctx: &(), tick: u64) -> TickerEvents {
            self.seen.push(tick);

            if tick.is_multiple_of(self.every) {
                TickerEvents::RECLAIM_MEMORY
            } else {
                TickerEvents::empty()
            }
        }
    }

    #[test]
    fn test_advance_counts_from_one() {
        let mut ticker = Ticker::default();
        let mut policy = EveryN {
            every: 3,
            seen: Vec::new(),
        };

        let events = (0..6)
            .map(|_| ticker.advance(&(), &mut policy))
            .filter(|(_, events)| events.contains(TickerEvents::RECLAIM_MEMORY))
            .map(|(tick, _)| tick)
            .collect::<Vec<_>>();

        assert_eq!(events, vec![3, 6]);
        assert_eq!(policy.seen, vec![1, 2, 3, 4, 5, 6]);
    }
}
