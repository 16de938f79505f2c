use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::model::ScenarioResponse;

/// Writes response deltas as CSV, one row per metric.
pub struct CsvWriter<W: Write> {
    w: W,
}

impl CsvWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        let f = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self { w: BufWriter::new(f) })
    }
}

impl<W: Write> CsvWriter<W> {
    pub fn new(w: W) -> Self {
        Self { w }
    }

    pub fn write_header(&mut self) -> Result<()> {
        writeln!(
            self.w,
            "scenario_type,site_scope,metric,baseline_value,scenario_value,\
             absolute_change,percent_change,unit,confidence,validity"
        )?;
        Ok(())
    }

    pub fn write_response(&mut self, resp: &ScenarioResponse) -> Result<()> {
        let scope = resp.request.site_scope.join(";");
        let validity = serde_json::to_value(resp.scenario_validity)?;
        let validity = validity.as_str().unwrap_or_default();
        for d in &resp.deltas {
            writeln!(
                self.w,
                "{},{},{},{:.2},{:.2},{:.2},{:.4},{},{:.3},{}",
                resp.request.scenario_type,
                escape(&scope),
                escape(&d.metric),
                d.baseline_value,
                d.scenario_value,
                d.absolute_change,
                d.percent_change,
                escape(&d.unit),
                resp.confidence,
                validity
            )?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
