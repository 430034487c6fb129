/**
The karis benchmark tools drive the irrigation controller (an ESP32 with six relays)
over MQTT. The same component pattern used across the control system applies here:
devices wrap the hardware and transport, components group them into a logical unit
that performs a function, and each binary under `systems/` starts a single component.
*/

/// Components in the system are created by grouping together
/// devices into a logical unit that performs some function,
/// in this case a benchmark run against the relay board.
pub mod components;
/// Devices that are an atomic unit, and can be composed
/// with other devices into components to perform some function.
pub mod devices;
/// Error type shared by the components and devices.
pub mod error;
/// Message structure for communication with the relay board,
/// both the commands sent and the status reports received.
pub mod messages;
/// Tracing setup and the CSV writer used for benchmark results.
pub mod logging;
/// Development utilities for working with time and test fixtures.
pub mod utils;
