//! Identifies the instrument mode, record count and hemisphere of a file.

use super::{keys, variable};
use crate::core::context::Context;
use crate::core::finder::InstrumentMode;
use crate::core::record::Record;
use crate::core::stage::{Outcome, Stage};

/// Reads `sir_op_mode` and `lat_20_ku` from the record
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentifyFile;

impl IdentifyFile {
    fn apply(&self, record: &dyn Record, context: &mut Context) -> Result<Outcome, String> {
        let latitudes = variable(record, "lat_20_ku")?;
        if latitudes.is_empty() {
            return Err("lat_20_ku has no records".to_string());
        }

        let op_mode = record
            .text_attribute("sir_op_mode")
            .ok_or_else(|| "sir_op_mode attribute not found".to_string())?;
        let mode = InstrumentMode::from_op_mode(op_mode)
            .ok_or_else(|| format!("Invalid mode attribute .sir_op_mode {op_mode}"))?;

        let finite: Vec<f64> = latitudes.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return Err("lat_20_ku has no valid latitudes".to_string());
        }
        let mean = finite.iter().sum::<f64>() / finite.len() as f64;
        let hemisphere = if mean < 0.0 { "south" } else { "north" };

        context
            .insert(keys::INSTR_MODE, mode.as_str())
            .and_then(|_| context.insert(keys::NUM_20HZ_RECORDS, latitudes.len()))
            .and_then(|_| context.insert(keys::HEMISPHERE, hemisphere))
            .map_err(|e| e.to_string())?;

        tracing::debug!(mode = %mode, records = latitudes.len(), hemisphere, "Identified file");
        Ok(Outcome::Continue)
    }
}

impl Stage for IdentifyFile {
    fn name(&self) -> &str {
        "identify_file"
    }

    fn produces(&self) -> &[&'static str] {
        &[keys::INSTR_MODE, keys::NUM_20HZ_RECORDS, keys::HEMISPHERE]
    }

    fn process(&self, record: &dyn Record, context: &mut Context) -> Outcome {
        self.apply(record, context).unwrap_or_else(Outcome::Fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::JsonRecord;

    #[test]
    fn identifies_sarin_file_in_south() {
        let record = JsonRecord::new("pass.json")
            .with_attribute("sir_op_mode", "SARIN")
            .with_variable("lat_20_ku", vec![-70.0, -71.0, f64::NAN]);
        let mut context = Context::new();

        let outcome = IdentifyFile.process(&record, &mut context);

        assert_eq!(outcome, Outcome::Continue);
        assert_eq!(context.text(keys::INSTR_MODE).unwrap(), "SIN");
        assert_eq!(context.int(keys::NUM_20HZ_RECORDS).unwrap(), 3);
        assert_eq!(context.text(keys::HEMISPHERE).unwrap(), "south");
    }

    #[test]
    fn northern_lrm_file() {
        let record = JsonRecord::new("pass.json")
            .with_attribute("sir_op_mode", "LRM")
            .with_variable("lat_20_ku", vec![72.0]);
        let mut context = Context::new();

        IdentifyFile.process(&record, &mut context);

        assert_eq!(context.text(keys::INSTR_MODE).unwrap(), "LRM");
        assert_eq!(context.text(keys::HEMISPHERE).unwrap(), "north");
    }

    #[test]
    fn invalid_mode_fails() {
        let record = JsonRecord::new("pass.json")
            .with_attribute("sir_op_mode", "PLRM")
            .with_variable("lat_20_ku", vec![72.0]);

        let outcome = IdentifyFile.process(&record, &mut Context::new());

        assert!(matches!(outcome, Outcome::Fail(m) if m.contains("PLRM")));
    }

    #[test]
    fn missing_latitudes_fail() {
        let record = JsonRecord::new("pass.json").with_attribute("sir_op_mode", "SAR");
        let outcome = IdentifyFile.process(&record, &mut Context::new());
        assert!(matches!(outcome, Outcome::Fail(m) if m.contains("lat_20_ku")));
    }
}
