use fail::FailScenario;

/// Fail scenario that turns its fail points off again when dropped.
///
/// `fail` configuration is process-global, so tests using this must not run concurrently with
/// other tests relying on the same fail points.
pub struct CustomFailScenario<'a> {
    _scenario: FailScenario<'a>,
    fail_points: Vec<String>,
}

impl<'a> CustomFailScenario<'a> {
    /// Configures every `(fail point, action)` pair, e.g. `("task_worker.after_persist", "1*return(requeue)")`.
    pub fn setup(fail_points: &[(&str, &str)]) -> CustomFailScenario<'a> {
        let scenario = FailScenario::setup();

        for (fail_point, action) in fail_points {
            fail::cfg(*fail_point, action).unwrap();
        }

        Self {
            _scenario: scenario,
            fail_points: fail_points
                .iter()
                .map(|(fail_point, _)| fail_point.to_string())
                .collect(),
        }
    }

    pub fn teardown(self) {
        drop(self);
    }
}

impl Drop for CustomFailScenario<'_> {
    fn drop(&mut self) {
        for fail_point in &self.fail_points {
            fail::remove(fail_point);
        }
    }
}
