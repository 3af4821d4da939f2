//! Configuration schema, queue-mode vocabulary, and on-disk state layout.
//!
//! The config file (`clawdis.json`) is a schema-versioned JSON document with
//! serde defaults per field; unknown keys are preserved on round-trip so a
//! `config.put(config.get())` through the gateway is a no-op.

pub mod config_reload;
pub mod config_schema;
pub mod state_paths;

pub use config_reload::{changed_config_prefixes, config_value_at_path};
pub use config_schema::{
    load_config, parse_config, save_config, AgentSection, ChannelSection, ClawdisConfig,
    DmPolicy, GatewayAuthMode, GatewayAuthSection, GatewaySection, GroupPolicy, GroupRule,
    HeartbeatSection, HeartbeatTarget, MessagesSection, QueueMode, QueueSection, SessionScope,
    SessionSection, CONFIG_SCHEMA_VERSION,
};
pub use state_paths::StateDir;
