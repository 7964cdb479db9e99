//! Well-known filesystem locations.

/// System-wide config file
pub const CONFIG_PATH: &str = "/etc/medic/config.toml";

/// Fallback config file
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/medic/config.toml";

/// Task/learning database
pub const DB_PATH: &str = "/var/lib/medic/medic.db";

/// Pidfile written by the daemon, read by `medicctl stop`
pub const PID_PATH: &str = "/run/medic/medicd.pid";

/// Escalations that no configured channel accepted end up here
pub const FALLBACK_LOG_PATH: &str = "/var/log/medic/escalations.jsonl";
