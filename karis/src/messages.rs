/// Standardise how messages are sent to and received from
/// the relay board. Provide test suite to ensure the
/// interfaces match what the firmware expects.
pub mod control {
    /// Relay messages set the target state of one or more
    /// relays, authorised with the device api key.
    pub mod relay;
}

/// Messages the relay board publishes about itself.
pub mod status {
    /// Relay status reports are published by the firmware
    /// whenever a relay changes state, and periodically.
    pub mod relay;
}
