use crate::error::KarisError;
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter applied when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

/// Initialise the tracing subscriber for a binary. The filter is read
/// from `RUST_LOG` and falls back to `info`.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false),
        )
        .with(filter)
        .init();
}

/// Write `records` as csv below a `header` row, which is written even when
/// there are no records. The file is written next to `path` first and
/// renamed into place, so an existing file is only replaced by a complete one.
///
/// * `path`: destination csv file.
/// * `header`: column names, matching the field order of `T`.
/// * `records`: rows to write, in order.
pub fn write_records<T, P>(path: P, header: &[&str], records: &[T]) -> Result<(), KarisError>
where
    T: Serialize,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    let written = write_csv(&partial, header, records)
        .and_then(|()| fs::rename(&partial, path).map_err(KarisError::from));
    if let Err(e) = written {
        fs::remove_file(&partial).ok();
        return Err(e);
    }
    info!(path = %path.display(), rows = records.len(), "Saved csv");
    Ok(())
}

fn write_csv<T>(path: &Path, header: &[&str], records: &[T]) -> Result<(), KarisError>
where
    T: Serialize,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    writer.write_record(header)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}
