use fail::FailScenario;

/// Configures failpoints for the duration of a test.
///
/// Holding the scenario serializes tests using failpoints. Every configured failpoint is turned
/// off again when the scenario is dropped.
pub struct MirrorFailScenario<'a> {
    _scenario: FailScenario<'a>,
    failpoints: Vec<String>,
}

impl<'a> MirrorFailScenario<'a> {
    /// Configures each `(failpoint, action)` pair, e.g. `("apply_batch.after_apply", "1*return")`.
    pub fn setup(failpoints: &[(&str, &str)]) -> MirrorFailScenario<'a> {
        let scenario = FailScenario::setup();

        for (failpoint, action) in failpoints {
            fail::cfg(*failpoint, action).expect("failpoint action is valid");
        }

        Self {
            _scenario: scenario,
            failpoints: failpoints
                .iter()
                .map(|(failpoint, _)| failpoint.to_string())
                .collect(),
        }
    }

    /// Turns `failpoint` off before the scenario ends.
    pub fn disable(&self, failpoint: &str) {
        fail::cfg(failpoint, "off").expect("failpoint can be turned off");
    }
}

impl Drop for MirrorFailScenario<'_> {
    fn drop(&mut self) {
        for failpoint in &self.failpoints {
            let _ = fail::cfg(failpoint, "off");
        }
    }
}
