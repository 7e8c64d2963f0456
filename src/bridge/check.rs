use super::VuContext;
use crate::stats::metric::{MetricKey, CHECKS, TAG_CHECK};

impl VuContext {
    /// Record a named check. Failing checks never stop the iteration.
    pub fn check(&mut self, name: &str, passed: bool) -> bool {
        self.sink()
            .rate(MetricKey::new(CHECKS).with_tag(TAG_CHECK, name), passed);
        passed
    }

    /// Evaluate `predicate` against `value` and record it as check `name`.
    pub fn check_with<T, F>(&mut self, value: &T, name: &str, predicate: F) -> bool
    where
        T: ?Sized,
        F: FnOnce(&T) -> bool,
    {
        let passed = predicate(value);
        self.check(name, passed)
    }
}
