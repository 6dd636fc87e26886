//! Protocol and configuration constants for smp.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Client version reported in the token handshake and handshake response.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version stamped into every outgoing frame.
pub const MESSAGE_SCHEMA_VERSION: u32 = 1;

/// Schema version string sent in the first (token) frame after open.
pub const OPEN_DATA_CHANNEL_SCHEMA_VERSION: &str = "1.0";

/// Chunk size for stream data read from stdin or local sockets.
pub const STREAM_DATA_PAYLOAD_SIZE: usize = 1024;

// =============================================================================
// Buffer Capacities
// =============================================================================

/// Maximum entries in the outgoing (unacknowledged) message buffer.
pub const OUTGOING_MESSAGE_BUFFER_CAPACITY: usize = 10_000;

/// Maximum entries in the incoming (reorder) message buffer.
pub const INCOMING_MESSAGE_BUFFER_CAPACITY: usize = 10_000;

// =============================================================================
// Timing Constants
// =============================================================================

/// Initial retransmission timeout.
pub const DEFAULT_TRANSMISSION_TIMEOUT: Duration = Duration::from_millis(200);

/// Initial round trip time estimate.
pub const DEFAULT_ROUND_TRIP_TIME: Duration = Duration::from_millis(100);

/// Initial round trip time variation.
pub const DEFAULT_ROUND_TRIP_TIME_VARIATION: f64 = 0.0;

/// Interval between resend scheduler wakeups.
pub const RESEND_SLEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Resend attempts before the stream is considered dead (5 minutes of ticks).
pub const RESEND_MAX_ATTEMPT: u32 = 3000;

/// Smoothing constant for the round trip time estimate (alpha = 1/8).
pub const RTT_CONSTANT: f64 = 1.0 / 8.0;

/// Smoothing constant for the round trip time variation (beta = 1/4).
pub const RTTV_CONSTANT: f64 = 1.0 / 4.0;

/// Lower bound on the variation term of the retransmission timeout.
pub const CLOCK_GRANULARITY: Duration = Duration::from_millis(10);

/// Upper bound on the retransmission timeout.
pub const MAX_TRANSMISSION_TIMEOUT: Duration = Duration::from_secs(1);

/// Websocket keep-alive ping interval.
pub const PING_TIME_INTERVAL: Duration = Duration::from_secs(300);

/// Consecutive websocket read failures tolerated before surfacing an error.
pub const WEBSOCKET_RETRY_ATTEMPT: u32 = 5;

// =============================================================================
// Reconnection Backoff
// =============================================================================

/// Geometric ratio of the reconnect backoff curve.
pub const RETRY_BASE: f64 = 2.0;

/// Maximum reconnect attempts per failure.
pub const DATA_CHANNEL_NUM_MAX_RETRIES: u32 = 5;

/// Lower bound of the randomized initial reconnect delay.
pub const DATA_CHANNEL_RETRY_INITIAL_DELAY_MILLIS: u64 = 100;

/// Cap on a single reconnect delay.
pub const DATA_CHANNEL_RETRY_MAX_INTERVAL_MILLIS: u64 = 5000;

// =============================================================================
// Plugin Names
// =============================================================================

/// Canonical name of the interactive shell subsystem.
pub const SHELL_PLUGIN_NAME: &str = "Standard_Stream";

/// Name of the port forwarding subsystem.
pub const PORT_PLUGIN_NAME: &str = "Port";

/// Session type announced by agents running interactive commands.
pub const INTERACTIVE_COMMANDS_PLUGIN_NAME: &str = "InteractiveCommands";

/// Session type announced by agents running non-interactive commands.
pub const NON_INTERACTIVE_COMMANDS_PLUGIN_NAME: &str = "NonInteractiveCommands";

// =============================================================================
// Agent Version Gates
// =============================================================================

/// Agents newer than this accept the TerminateSession flag over the channel.
pub const TERMINATE_SESSION_FLAG_SUPPORTED_AFTER: &str = "2.3.722.0";

/// Agents newer than this multiplex TCP connections over one channel.
pub const TCP_MULTIPLEXING_SUPPORTED_AFTER: &str = "3.0.196.0";

/// Agents newer than this require mux keep-alive to be disabled.
pub const MUX_KEEP_ALIVE_DISABLED_AFTER: &str = "3.1.1511.0";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_constants_are_ordered() {
        assert!(DEFAULT_TRANSMISSION_TIMEOUT < MAX_TRANSMISSION_TIMEOUT);
        assert!(CLOCK_GRANULARITY < DEFAULT_TRANSMISSION_TIMEOUT);
        assert!(RESEND_SLEEP_INTERVAL <= DEFAULT_TRANSMISSION_TIMEOUT);
    }

    #[test]
    fn resend_budget_is_five_minutes() {
        let total = RESEND_SLEEP_INTERVAL * RESEND_MAX_ATTEMPT;
        assert_eq!(total, Duration::from_secs(300));
    }

    #[test]
    fn buffer_capacities_match() {
        assert_eq!(OUTGOING_MESSAGE_BUFFER_CAPACITY, INCOMING_MESSAGE_BUFFER_CAPACITY);
    }
}
