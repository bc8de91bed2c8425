/// Application name
pub const APP_NAME: &str = "LostLink";

/// Header an upstream auth proxy uses to pass the verified identity
pub const DEFAULT_IDENTITY_HEADER: &str = "x-authenticated-user";

/// SSE event name for match suggestion updates
pub const MATCHES_EVENT: &str = "matches";

/// Score reported when one side has no usable embedding
pub const NO_EMBEDDING_SCORE: f64 = -1.0;

/// Number of suggestions kept per analysis run
pub const DEFAULT_MATCH_LIMIT: usize = 5;

/// Match stream subscriptions expire after 30 minutes
pub const DEFAULT_SUBSCRIPTION_TIMEOUT_SECS: u64 = 30 * 60;

/// Outbound queue depth per live channel
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Maximum chat message length in bytes (64 KiB)
pub const MAX_MESSAGE_TEXT: usize = 65_536;

/// Error text pushed to a sender whose message hit a block
pub const BLOCKED_NOTICE: &str = "Message blocked by user";

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
