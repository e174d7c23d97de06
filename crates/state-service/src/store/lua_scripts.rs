//! Lua scripts for atomic multi-step Redis operations.
//!
//! Redis executes a script atomically, so no other client can observe the
//! state between its steps.

/// Increment a counter and set its expiry only when this call created it.
///
/// Arguments:
/// - KEYS[1]: Counter key (e.g., `rate:login:10.0.0.1:29481722`)
/// - ARGV[1]: Expiry in milliseconds; `0` means no expiry
///
/// Returns:
/// - The post-increment counter value
///
/// Without the script, a crash between INCR and PEXPIRE would leave a
/// counter that never resets.
pub const INCR_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl_ms = tonumber(ARGV[1])

if count == 1 and ttl_ms ~= nil and ttl_ms > 0 then
    redis.call('PEXPIRE', KEYS[1], ttl_ms)
end

return count
"#;
