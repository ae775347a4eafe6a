use core::fmt::Debug;

use crate::error::Error;
use crate::types::token::Amount;

pub fn assert_eq<T: Eq + Debug>(message: &str, left: &T, right: &T) -> Result<(), Error> {
    if left == right {
        Ok(())
    } else {
        Err(Error::assertion(format!(
            "expect left ({left:?}) to be equal to right ({right:?}): {message}"
        )))
    }
}

pub fn assert_not_eq<T: Eq + Debug>(message: &str, left: &T, right: &T) -> Result<(), Error> {
    if left != right {
        Ok(())
    } else {
        Err(Error::assertion(format!(
            "expect left ({left:?}) to be not equal to right ({right:?}): {message}"
        )))
    }
}

pub fn assert_gt<T: Ord + Debug>(message: &str, left: &T, right: &T) -> Result<(), Error> {
    if left > right {
        Ok(())
    } else {
        Err(Error::assertion(format!(
            "expect left ({left:?}) to be greater than right ({right:?}): {message}"
        )))
    }
}

pub fn assert_err<T: Debug, E: Debug>(message: &str, result: Result<T, E>) -> Result<(), Error> {
    if result.is_err() {
        Ok(())
    } else {
        Err(Error::assertion(format!(
            "expect result ({result:?}) to be an error: {message}"
        )))
    }
}

/**
   Assert that `actual` lies within `basis_points / 10_000` of `expected`.
   The tolerance is chosen by the caller.
*/
pub fn assert_within(
    message: &str,
    expected: Amount,
    actual: Amount,
    basis_points: u128,
) -> Result<(), Error> {
    let delta = expected.0.abs_diff(actual.0);
    let allowed = expected.0.saturating_mul(basis_points) / 10_000;

    if delta <= allowed {
        Ok(())
    } else {
        Err(Error::assertion(format!(
            "expect {actual} to be within {basis_points} bps of {expected}: {message}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_is_relative_to_expected() {
        assert!(assert_within("swap", Amount(1000), Amount(1049), 500).is_ok());
        assert!(assert_within("swap", Amount(1000), Amount(951), 500).is_ok());
        assert!(assert_within("swap", Amount(1000), Amount(1051), 500).is_err());
    }
}
