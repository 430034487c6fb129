use crate::error::KarisError;
use serde::de::DeserializeOwned;
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Prefix for environment variables that override values in a config
/// file, e.g. `KARIS_API_KEY` or `KARIS_BROKER__HOST`.
pub const ENV_PREFIX: &str = "KARIS";

/// Read a yaml config file into `T`, then apply any `KARIS_` environment
/// overrides on top. Nested keys are separated with a double underscore.
///
/// * `filepath`: path to the yaml file.
pub fn from_yaml_file<T, F>(filepath: F) -> Result<T, KarisError>
where
    T: DeserializeOwned,
    F: AsRef<OsStr>,
{
    let file = Path::new(&filepath);
    if !file.is_file() {
        return Err(KarisError::MissingConfig(file.to_path_buf()));
    }
    let config_file = config::Config::builder()
        .add_source(config::File::new(
            &file.to_string_lossy(),
            config::FileFormat::Yaml,
        ))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(config_file.try_deserialize::<T>()?)
}

/// Config files reference each other with paths relative to the file
/// they are written in. Absolute paths are returned unchanged.
///
/// * `config_file`: the file containing the reference.
/// * `referenced`: the path as written in that file.
pub fn resolve_relative<F: AsRef<OsStr>>(config_file: F, referenced: &Path) -> PathBuf {
    if referenced.is_absolute() {
        return referenced.to_path_buf();
    }
    match Path::new(&config_file).parent() {
        Some(parent) => parent.join(referenced),
        None => referenced.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/etc/karis/latency.yaml", "../devices/board.yaml", "/etc/karis/../devices/board.yaml")]
    #[case("/etc/karis/latency.yaml", "/opt/board.yaml", "/opt/board.yaml")]
    #[case("latency.yaml", "board.yaml", "board.yaml")]
    fn test_resolve_relative(
        #[case] config_file: &str,
        #[case] referenced: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(
            resolve_relative(config_file, Path::new(referenced)),
            PathBuf::from(expected)
        );
    }

    #[test]
    fn test_missing_file() {
        let result: Result<serde_yaml::Value, _> = from_yaml_file("/does/not/exist.yaml");
        assert!(matches!(result, Err(KarisError::MissingConfig(_))));
    }
}
