use {
    model::order::Order,
    num::{BigRational, One, Zero},
    number::conversions::u256_to_big_rational,
};

/// Decides whether the unsettled remainder of an order is still worth
/// trading.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
pub trait DustEvaluating: Send + Sync {
    fn is_dust(&self, order: &Order) -> bool;
}

/// Treats a remainder below a fixed fraction of the original amount as dust.
pub struct FractionDust {
    threshold: BigRational,
}

impl FractionDust {
    /// `threshold` is clamped to `[0, 1]`.
    pub fn new(threshold: BigRational) -> Self {
        let threshold = threshold.clamp(BigRational::zero(), BigRational::one());
        Self { threshold }
    }
}

impl DustEvaluating for FractionDust {
    fn is_dust(&self, order: &Order) -> bool {
        let remaining = order.remaining_amount();
        if remaining.is_zero() {
            return true;
        }
        u256_to_big_rational(&remaining)
            < &self.threshold * u256_to_big_rational(&order.original_amount())
    }
}
