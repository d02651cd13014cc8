use nutype::nutype;

/// Scalar price a worker asks per unit of work. Always finite and
/// non-negative, so the total order used by the auction is well defined.
#[nutype(
    validate(finite, greater_or_equal = 0.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Rate(f64);

impl Rate {
    /// Ascending order on the offered rate; total because NaN is rejected.
    pub fn cmp_asc(&self, other: &Rate) -> std::cmp::Ordering {
        self.into_inner().total_cmp(&other.into_inner())
    }
}
