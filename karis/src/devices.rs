/// Devices are the atomic units that can be combined together
/// into components. Their core responsibilities do not change
/// based on which benchmark is using them.
pub mod hardware {
    /// Device interface for the six relay irrigation controller.
    pub mod relay_board;
}

/// Software devices that sit between the components and the hardware.
pub mod software {
    /// Connection to the MQTT broker the relay board is attached to.
    pub mod broker;
}
