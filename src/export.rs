//! Run metadata export as CSV, one row per run ordered by run number.

use crate::error::{AppResult, DaqError};
use crate::ids::ExperimentId;
use crate::store::Store;
use std::io::Write;
use tracing::info;

/// Column headers of the run metadata export.
pub const RUN_METADATA_HEADER: [&str; 6] = [
    "run number",
    "run class",
    "title",
    "start date/time",
    "stop date/time",
    "config name",
];

/// Download name for an experiment's run metadata.
pub fn run_metadata_file_name(experiment_name: &str) -> String {
    format!("{experiment_name} run metadata.csv")
}

/// Write the run metadata of `experiment` to `out`.
///
/// Open runs get an empty stop column. Returns the number of rows written.
pub fn write_run_metadata<W: Write>(store: &Store, experiment: ExperimentId, out: W) -> AppResult<usize> {
    let exp = store.experiment(experiment)?;
    let runs = store.runs_for(experiment);

    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(RUN_METADATA_HEADER)?;
    for run in &runs {
        writer.write_record([
            run.run_number.to_string(),
            run.run_class.map(|c| c.to_string()).unwrap_or_default(),
            run.title.clone().unwrap_or_default(),
            run.start.to_rfc3339(),
            run.stop.map(|t| t.to_rfc3339()).unwrap_or_default(),
            run.config_name(),
        ])?;
    }
    writer.flush()?;

    info!(experiment = %exp.name, runs = runs.len(), "Exported run metadata");
    Ok(runs.len())
}

/// Run metadata of `experiment` as CSV text.
pub fn run_metadata_csv(store: &Store, experiment: ExperimentId) -> AppResult<String> {
    let mut buf = Vec::new();
    write_run_metadata(store, experiment, &mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| DaqError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}
