pub mod settings;

pub use settings::{
    generate_default_config, AuthSettings, JobSettings, LockSettings, PollingSettings,
    ProvisioningSettings, ProxmoxSettings, RateLimitSettings, RouterSettings, ServerSettings,
    Settings,
};
