use std::env::{self, VarError};

use super::ReadEnv;

/// Reads the real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> Result<String, VarError> {
        env::var(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variable_is_not_present() {
        let result = SystemEnv.var("RPNET_SURELY_UNSET_VARIABLE_4711");
        assert!(matches!(result, Err(VarError::NotPresent)));
    }

    #[test]
    fn parsed_of_missing_variable_is_none() {
        assert!(
            SystemEnv
                .parsed::<u64>("RPNET_SURELY_UNSET_VARIABLE_4711")
                .is_none()
        );
    }
}
