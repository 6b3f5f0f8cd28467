//! Skips files acquired in unwanted instrument modes.

use super::keys;
use crate::core::context::Context;
use crate::core::finder::InstrumentMode;
use crate::core::record::Record;
use crate::core::stage::{Outcome, Stage, StageInit};
use crate::error::StageError;

/// Skips files whose `instr_mode` is listed in `skip_modes` (default SAR)
#[derive(Debug, Clone)]
pub struct SkipOnMode {
    skip_modes: Vec<InstrumentMode>,
}

impl Default for SkipOnMode {
    fn default() -> Self {
        Self {
            skip_modes: vec![InstrumentMode::Sar],
        }
    }
}

impl Stage for SkipOnMode {
    fn name(&self) -> &str {
        "skip_on_mode"
    }

    fn requires(&self) -> &[&'static str] {
        &[keys::INSTR_MODE]
    }

    fn initialize(&mut self, init: &StageInit<'_>) -> Result<(), StageError> {
        if let Some(modes) = init.get::<Vec<String>>("skip_modes")? {
            let parsed: Result<Vec<InstrumentMode>, _> =
                modes.iter().map(|m| m.parse::<InstrumentMode>()).collect();
            self.skip_modes = parsed.map_err(|e| StageError::InvalidConfig {
                stage: init.name.to_string(),
                key: "skip_modes".to_string(),
                reason: e.to_string(),
            })?;
        }
        tracing::debug!(skip_modes = ?self.skip_modes, "skip_on_mode initialized");
        Ok(())
    }

    fn process(&self, _record: &dyn Record, context: &mut Context) -> Outcome {
        let mode = match context.text(keys::INSTR_MODE) {
            Ok(mode) => mode,
            Err(e) => return e.into(),
        };
        match mode.parse::<InstrumentMode>() {
            Ok(mode) if self.skip_modes.contains(&mode) => {
                Outcome::skip(format!("{mode} mode file skipped"))
            }
            Ok(_) => Outcome::Continue,
            Err(e) => Outcome::fail(e.to_string()),
        }
    }
}
