//! Minimal stages for exercising the engine end to end.

use crate::core::context::Context;
use crate::core::record::Record;
use crate::core::stage::{Outcome, Stage};

/// Writes `test = true`
#[derive(Debug, Default, Clone, Copy)]
pub struct TestAlg1;

impl Stage for TestAlg1 {
    fn name(&self) -> &str {
        "test_alg1"
    }

    fn produces(&self) -> &[&'static str] {
        &["test"]
    }

    fn process(&self, _record: &dyn Record, context: &mut Context) -> Outcome {
        context.insert("test", true).into()
    }
}

/// Reads `test`, writes `test2`
#[derive(Debug, Default, Clone, Copy)]
pub struct TestAlg2;

impl Stage for TestAlg2 {
    fn name(&self) -> &str {
        "test_alg2"
    }

    fn requires(&self) -> &[&'static str] {
        &["test"]
    }

    fn produces(&self) -> &[&'static str] {
        &["test2"]
    }

    fn process(&self, _record: &dyn Record, context: &mut Context) -> Outcome {
        match context.flag("test") {
            Ok(true) => context.insert("test2", true).into(),
            Ok(false) => Outcome::fail("test flag is false"),
            Err(e) => e.into(),
        }
    }
}

/// Acts on the record's `inject` attribute: `skip`, `fail`, or `crash`
/// (aborts the whole process, only meaningful in worker processes).
#[derive(Debug, Default, Clone, Copy)]
pub struct FaultInjector;

impl Stage for FaultInjector {
    fn name(&self) -> &str {
        "fault_injector"
    }

    fn process(&self, record: &dyn Record, _context: &mut Context) -> Outcome {
        match record.text_attribute("inject") {
            Some("skip") => Outcome::skip("injected skip"),
            Some("fail") => Outcome::fail("injected failure"),
            Some("crash") => {
                tracing::error!(path = %record.path().display(), "Injected crash");
                std::process::abort();
            }
            _ => Outcome::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::JsonRecord;

    #[test]
    fn alg2_reads_what_alg1_wrote() {
        let record = JsonRecord::new("p.json");
        let mut context = Context::new();

        assert_eq!(TestAlg1.process(&record, &mut context), Outcome::Continue);
        assert_eq!(TestAlg2.process(&record, &mut context), Outcome::Continue);
        assert!(context.flag("test2").unwrap());
    }

    #[test]
    fn alg2_without_alg1_fails() {
        let outcome = TestAlg2.process(&JsonRecord::new("p.json"), &mut Context::new());
        assert!(matches!(outcome, Outcome::Fail(_)));
    }

    #[test]
    fn injector_follows_attribute() {
        let mut context = Context::new();
        let skip = JsonRecord::new("a.json").with_attribute("inject", "skip");
        let fail = JsonRecord::new("b.json").with_attribute("inject", "fail");
        let clean = JsonRecord::new("c.json");

        assert!(matches!(FaultInjector.process(&skip, &mut context), Outcome::Skip(_)));
        assert!(matches!(FaultInjector.process(&fail, &mut context), Outcome::Fail(_)));
        assert_eq!(FaultInjector.process(&clean, &mut context), Outcome::Continue);
    }
}
