use std::env::VarError;
use std::str::FromStr;

pub trait ReadEnv {
    fn var(&self, key: &str) -> Result<String, VarError>;

    /// Reads and parses `key`.
    ///
    /// Returns `None` when the variable is unset, and `Some(Err(raw))` with the
    /// raw value when it is set but does not parse, so callers can log it.
    fn parsed<T: FromStr>(&self, key: &str) -> Option<Result<T, String>> {
        let raw = self.var(key).ok()?;
        let trimmed = raw.trim();
        Some(trimmed.parse::<T>().map_err(|_| raw.clone()))
    }
}
