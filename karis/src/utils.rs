/// Compile time checks for fixture files used in tests.
pub mod tests;
/// Wall clock and monotonic timestamps, and the time of day labels
/// used when reporting results.
pub mod time;
/// Loading of the yaml config files shared by every component.
pub mod settings;
