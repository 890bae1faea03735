use crate::domain::Side;

/// How an entry signal is turned into orders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipPlan {
    /// Single resting limit of `size`
    Normal { size: u32 },
    /// Reversal sized signal with nothing to reverse: enter half as a plain limit
    Reduced { size: u32 },
    /// Reverse an opposing position: market leg flattens, limit leg re-enters
    Split { market_size: u32, limit_size: u32 },
}

impl FlipPlan {
    /// Size of the resting limit entry the watcher will follow.
    pub fn limit_size(&self) -> u32 {
        match self {
            FlipPlan::Normal { size } | FlipPlan::Reduced { size } => *size,
            FlipPlan::Split { limit_size, .. } => *limit_size,
        }
    }

    pub fn is_reversal(&self) -> bool {
        matches!(self, FlipPlan::Split { .. })
    }
}

/// Position-flip sizing.
///
/// A signal whose size equals `reversal_size` is the alert source's way of
/// saying "close the old side and open the new one". It becomes a market
/// order for half plus a limit for the rest, but only while the account holds
/// a position on the opposite side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlipPolicy {
    reversal_size: Option<u32>,
}

impl FlipPolicy {
    pub fn new(reversal_size: Option<u32>) -> Self {
        Self { reversal_size }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn reversal_size(&self) -> Option<u32> {
        self.reversal_size
    }

    pub fn plan(&self, side: Side, size: u32, net_position: i64) -> FlipPlan {
        let Some(reversal) = self.reversal_size else {
            return FlipPlan::Normal { size };
        };
        if size != reversal || size < 2 {
            return FlipPlan::Normal { size };
        }

        let half = size / 2;
        let opposing = match side {
            Side::Buy => net_position < 0,
            Side::Sell => net_position > 0,
        };
        if opposing {
            FlipPlan::Split {
                market_size: half,
                limit_size: size - half,
            }
        } else {
            FlipPlan::Reduced { size: half }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_policy_is_passthrough() {
        let policy = FlipPolicy::disabled();
        assert_eq!(policy.plan(Side::Buy, 8, -4), FlipPlan::Normal { size: 8 });
    }

    #[test]
    fn test_reversal_against_opposing_position() {
        let policy = FlipPolicy::new(Some(8));
        assert_eq!(
            policy.plan(Side::Buy, 8, -4),
            FlipPlan::Split {
                market_size: 4,
                limit_size: 4
            }
        );
        assert_eq!(
            policy.plan(Side::Sell, 8, 4),
            FlipPlan::Split {
                market_size: 4,
                limit_size: 4
            }
        );
    }

    #[test]
    fn test_reversal_when_flat_or_same_side() {
        let policy = FlipPolicy::new(Some(8));
        assert_eq!(policy.plan(Side::Buy, 8, 0), FlipPlan::Reduced { size: 4 });
        assert_eq!(policy.plan(Side::Buy, 8, 4), FlipPlan::Reduced { size: 4 });
        assert_eq!(policy.plan(Side::Sell, 8, -4).limit_size(), 4);
    }

    #[test]
    fn test_other_sizes_untouched() {
        let policy = FlipPolicy::new(Some(8));
        let plan = policy.plan(Side::Buy, 4, -4);
        assert_eq!(plan, FlipPlan::Normal { size: 4 });
        assert!(!plan.is_reversal());
    }

    #[test]
    fn test_odd_reversal_size_puts_remainder_on_limit() {
        let policy = FlipPolicy::new(Some(5));
        assert_eq!(
            policy.plan(Side::Sell, 5, 3),
            FlipPlan::Split {
                market_size: 2,
                limit_size: 3
            }
        );
    }
}
