pub mod instance;

pub use instance::{
    EnvSetting, InstanceConfiguration, InstanceState, InstanceStatus, InstanceTimestamps,
    PortMapping,
};
