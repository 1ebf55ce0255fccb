//! Well-known fabric ports. All three are overridable in the daemon config.

/// Cards connect here to start monitoring.
pub const DEFAULT_MONITOR_PORT: u16 = 4100;

/// The host connects back to this port on the card to open the broadcast channel.
pub const DEFAULT_MONITOR_REPLY_PORT: u16 = 4101;

/// Card-side users connect here to request their cookie be distributed.
pub const DEFAULT_CREDENTIAL_PORT: u16 = 4102;
