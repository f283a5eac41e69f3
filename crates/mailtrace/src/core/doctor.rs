use std::io::{self, Write};
use std::path::Path;

use anyhow::{Result, bail};
use mailtrace_core::settings::{MappingReport, Settings, check_mapping};

/// Prints the OpenSearch field-mapping report.
pub fn doctor(
    path: &Path,
    settings: &Settings
) -> Result<()> {
    let report = check_mapping(&settings.opensearch.mapping);
    let mut out = io::stdout().lock();
    writeln!(out, "config: {}", path.display())?;
    writeln!(out, "method: {}", settings.method.as_str())?;
    write_report(&mut out, &report)?;
    out.flush()?;

    if !report.is_ok() {
        bail!("field mapping has {} error(s)", report.errors.len());
    }
    Ok(())
}

fn write_report<W: Write>(
    out: &mut W,
    report: &MappingReport
) -> io::Result<()> {
    for issue in &report.errors {
        writeln!(out, "ERROR   {}: {}", issue.field, issue.message)?;
    }
    for issue in &report.warnings {
        writeln!(out, "WARNING {}: {}", issue.field, issue.message)?;
    }
    writeln!(out, "configured:   {}", join_or_none(&report.configured))?;
    writeln!(out, "unconfigured: {}", join_or_none(&report.unconfigured))
}

fn join_or_none(fields: &[&str]) -> String {
    if fields.is_empty() { "(none)".to_string() } else { fields.join(", ") }
}
