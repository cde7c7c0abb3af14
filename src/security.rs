//! Input sanitizers, SSRF-safe URL checks, error redaction, and the
//! per-operation rate limiter.
//!
//! Everything that arrives from outside the process (chat commands, A2A
//! requests, callback URLs) passes through here before touching a core
//! component, and every error message leaves through `redact_error`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::clock::SharedClock;
use crate::network_type::NetworkType;
use crate::units;

pub const RATE_LIMIT_FILE: &str = "rate-limit-state.json";

pub const DESCRIPTION_MAX: usize = 500;
pub const REFERENCE_MAX: usize = 100;
const REDACTED_MAX: usize = 200;

const BASE58_CHARS: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const ALLOWED_CALLBACK_PORTS: [u16; 4] = [80, 443, 8080, 8443];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SanitizeError {
    #[error("description must be 1..={DESCRIPTION_MAX} characters")]
    DescriptionLength,
    #[error("description contains a disallowed pattern")]
    DescriptionPattern,
    #[error("reference must be alphanumeric, `-` or `_`, at most {REFERENCE_MAX} characters")]
    Reference,
    #[error("amount must be a positive finite number")]
    AmountInvalid,
    #[error("amount exceeds the maximum of {} DOGE", units::MAX_DOGE)]
    AmountTooLarge,
    #[error("invalid {0} address")]
    Address(NetworkType),
    #[error("callback URL rejected: {0}")]
    CallbackUrl(String),
}

// ── Description / reference / amount / address ────────────────────────────

/// Trim, collapse whitespace, drop control characters, bound the length,
/// reject script/SQL-looking content, HTML-escape the rest.
pub fn sanitize_description(input: &str) -> Result<String, SanitizeError> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if cleaned.is_empty() || cleaned.chars().count() > DESCRIPTION_MAX {
        return Err(SanitizeError::DescriptionLength);
    }

    let lower = cleaned.to_lowercase();
    let suspicious = [
        "<script",
        "</script",
        "javascript:",
        "onerror=",
        "onload=",
        "drop table",
        "insert into",
        "delete from",
        "union select",
        "' or '1'='1",
        "--;",
    ];
    if suspicious.iter().any(|p| lower.contains(p)) {
        return Err(SanitizeError::DescriptionPattern);
    }

    Ok(html_escape(&cleaned))
}

pub fn sanitize_reference(input: &str) -> Result<String, SanitizeError> {
    let trimmed = input.trim();
    if trimmed.is_empty()
        || trimmed.len() > REFERENCE_MAX
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(SanitizeError::Reference);
    }
    Ok(trimmed.to_string())
}

pub struct SanitizedAmount {
    /// Rounded to 8 decimals.
    pub doge: f64,
    pub koinu: u64,
    /// Above the configured mainnet warn threshold.
    pub warn: bool,
}

pub fn sanitize_amount(amount: f64, warn_threshold_doge: f64) -> Result<SanitizedAmount, SanitizeError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(SanitizeError::AmountInvalid);
    }
    let koinu = units::doge_to_koinu(amount).ok_or(SanitizeError::AmountTooLarge)?;
    if koinu == 0 {
        return Err(SanitizeError::AmountInvalid);
    }
    let doge = units::koinu_to_doge(koinu);
    Ok(SanitizedAmount {
        doge,
        koinu,
        warn: doge > warn_threshold_doge,
    })
}

/// Shape check only (prefix, length, base58 charset); the checksum proper is
/// verified by `Address::from_string`.
pub fn sanitize_address(input: &str, network: NetworkType) -> Result<String, SanitizeError> {
    let trimmed = input.trim();
    let mut chars = trimmed.chars();
    let first = chars.next().ok_or(SanitizeError::Address(network))?;
    if first != network.address_prefix_char() {
        return Err(SanitizeError::Address(network));
    }
    let rest: Vec<char> = chars.collect();
    if !(25..=34).contains(&rest.len()) {
        return Err(SanitizeError::Address(network));
    }
    if !rest.iter().all(|c| BASE58_CHARS.contains(*c)) {
        return Err(SanitizeError::Address(network));
    }
    Ok(trimmed.to_string())
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

// ── Callback URL / SSRF ───────────────────────────────────────────────────

/// HTTPS only, named host only (no IP literals), no loopback/link-local/
/// private/metadata hosts, restricted port set.
pub fn check_callback_url(input: &str) -> Result<String, SanitizeError> {
    let url = reqwest::Url::parse(input.trim())
        .map_err(|_| SanitizeError::CallbackUrl("unparsable URL".into()))?;

    if url.scheme() != "https" {
        return Err(SanitizeError::CallbackUrl("HTTPS required".into()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| SanitizeError::CallbackUrl("missing host".into()))?
        .trim_matches(['[', ']'])
        .to_lowercase();

    if host.parse::<IpAddr>().is_ok() {
        return Err(SanitizeError::CallbackUrl("IP-literal hosts rejected".into()));
    }
    if is_blocked_hostname(&host) {
        return Err(SanitizeError::CallbackUrl(format!("blocked host {host}")));
    }

    let port = url.port_or_known_default().unwrap_or(443);
    if !ALLOWED_CALLBACK_PORTS.contains(&port) {
        return Err(SanitizeError::CallbackUrl(format!("port {port} not allowed")));
    }

    Ok(url.to_string())
}

fn is_blocked_hostname(host: &str) -> bool {
    let blocked_exact = [
        "localhost",
        "metadata.google.internal",
        "metadata",
        "instance-data",
    ];
    if blocked_exact.contains(&host) {
        return true;
    }
    let blocked_suffixes = [".localhost", ".local", ".internal", ".lan", ".home.arpa"];
    blocked_suffixes.iter().any(|s| host.ends_with(s))
}

/// Rejects the address ranges an attacker could reach through a resolver we
/// do not control. Used by the callback dispatcher after DNS resolution.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_link_local()
                || v4.is_private()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // cloud metadata
                || v4.octets() == [169, 254, 169, 254]
                // CGNAT
                || (v4.octets()[0] == 100 && (64..128).contains(&v4.octets()[1]))
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // link-local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                // unique-local fc00::/7
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // v4-mapped
                || v6.to_ipv4_mapped().map(|v4| is_blocked_ip(IpAddr::V4(v4))).unwrap_or(false)
        }
    }
}

// ── Error redaction ───────────────────────────────────────────────────────

/// Strip anything that could leak internals from a user-facing message:
/// filesystem paths, stack frames, OS error codes, long hex/base64 blobs.
pub fn redact_error(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for line in message.lines() {
        let trimmed = line.trim_start();
        // stack frames
        if trimmed.starts_with("at ") || trimmed.starts_with("stack backtrace") {
            continue;
        }
        out.push_str(line);
        out.push(' ');
    }

    let mut redacted = String::with_capacity(out.len());
    for token in out.split_whitespace() {
        let cleaned = token.trim_matches(|c: char| c == '"' || c == '\'' || c == '(' || c == ')');
        if cleaned.starts_with('/') && cleaned.len() > 1 && cleaned.contains('/') {
            redacted.push_str("[path]");
        } else if is_long_hex(cleaned) {
            redacted.push_str("[hex]");
        } else if is_long_base64(cleaned) {
            redacted.push_str("[data]");
        } else {
            redacted.push_str(token);
        }
        redacted.push(' ');
    }

    // "(os error 13)" style codes
    let mut result = String::with_capacity(redacted.len());
    let mut rest = redacted.trim();
    while let Some(pos) = rest.find("os error ") {
        result.push_str(&rest[..pos]);
        result.push_str("os error [n]");
        let after = &rest[pos + "os error ".len()..];
        let skip = after
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after.len());
        rest = &after[skip..];
    }
    result.push_str(rest);

    crate::chain::truncate(&result, REDACTED_MAX)
}

fn is_long_hex(s: &str) -> bool {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    stripped.len() >= 32 && stripped.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_long_base64(s: &str) -> bool {
    s.len() >= 40
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

// ── Rate limiter ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WindowEntry {
    count: u32,
    window_start: i64,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RateLimitFile {
    version: u32,
    windows: HashMap<String, WindowEntry>,
}

#[derive(Clone, Debug)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_in_ms: u64,
    pub reason: Option<String>,
}

/// Windowed per-operation limiter, optionally scoped by subject. State is
/// persisted so a restart cannot reset the windows.
pub struct RateLimiter {
    path: PathBuf,
    clock: SharedClock,
    limits: HashMap<String, RateLimit>,
    default_limit: RateLimit,
    windows: Mutex<HashMap<String, WindowEntry>>,
}

impl RateLimiter {
    pub fn new(data_dir: &std::path::Path, clock: SharedClock) -> Self {
        let limits: HashMap<String, RateLimit> = [
            ("unlock", RateLimit { max_requests: 5, window_ms: 300_000 }),
            ("send", RateLimit { max_requests: 10, window_ms: 60_000 }),
            ("approve", RateLimit { max_requests: 30, window_ms: 60_000 }),
            ("invoice_create", RateLimit { max_requests: 60, window_ms: 3_600_000 }),
            ("verify_payment", RateLimit { max_requests: 60, window_ms: 60_000 }),
            ("balance", RateLimit { max_requests: 120, window_ms: 60_000 }),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            path: data_dir.join(RATE_LIMIT_FILE),
            clock,
            limits,
            default_limit: RateLimit {
                max_requests: 30,
                window_ms: 60_000,
            },
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_limit(&mut self, operation: &str, limit: RateLimit) {
        self.limits.insert(operation.to_string(), limit);
    }

    pub fn load(&self) -> Result<(), crate::error::WalletError> {
        if let Some(file) = crate::secure_fs::read_json::<RateLimitFile>(&self.path)? {
            *self.windows.lock() = file.windows;
        }
        Ok(())
    }

    /// Consume one request from the operation's window.
    pub fn consume(&self, operation: &str, subject: Option<&str>) -> RateDecision {
        let limit = self
            .limits
            .get(operation)
            .copied()
            .unwrap_or(self.default_limit);
        let key = match subject {
            Some(s) => format!("{operation}:{s}"),
            None => operation.to_string(),
        };
        let now = self.clock.now_ms();

        let decision = {
            let mut windows = self.windows.lock();

            // lazy expiry keeps the map bounded
            windows.retain(|_, w| now - w.window_start < limit.window_ms as i64 * 10);

            let entry = windows.entry(key).or_insert(WindowEntry {
                count: 0,
                window_start: now,
            });
            if now - entry.window_start >= limit.window_ms as i64 {
                entry.count = 0;
                entry.window_start = now;
            }

            if entry.count >= limit.max_requests {
                let reset_in_ms =
                    (entry.window_start + limit.window_ms as i64 - now).max(0) as u64;
                RateDecision {
                    allowed: false,
                    remaining: 0,
                    reset_in_ms,
                    reason: Some(format!(
                        "rate limit for `{operation}`: {} per {} ms",
                        limit.max_requests, limit.window_ms
                    )),
                }
            } else {
                entry.count += 1;
                RateDecision {
                    allowed: true,
                    remaining: limit.max_requests - entry.count,
                    reset_in_ms: (entry.window_start + limit.window_ms as i64 - now).max(0) as u64,
                    reason: None,
                }
            }
        };
        decision
    }

    /// Persisted on shutdown and after notable denials.
    pub fn persist(&self) {
        let file = RateLimitFile {
            version: 1,
            windows: self.windows.lock().clone(),
        };
        if let Err(e) = crate::secure_fs::write_json(&self.path, &file) {
            tracing::warn!(error = %e, "Failed to persist rate-limit state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn description_is_cleaned_and_escaped() {
        let out = sanitize_description("  coffee \t run\u{0007}  <3  ").unwrap();
        assert_eq!(out, "coffee run &lt;3");
    }

    #[test]
    fn description_rejects_injections() {
        assert_eq!(
            sanitize_description("<script>alert(1)</script>"),
            Err(SanitizeError::DescriptionPattern)
        );
        assert_eq!(
            sanitize_description("x'; DROP TABLE invoices; --"),
            Err(SanitizeError::DescriptionPattern)
        );
        assert_eq!(sanitize_description("   "), Err(SanitizeError::DescriptionLength));
        assert_eq!(
            sanitize_description(&"a".repeat(501)),
            Err(SanitizeError::DescriptionLength)
        );
    }

    #[test]
    fn reference_charset() {
        assert_eq!(sanitize_reference("order_42-A").unwrap(), "order_42-A");
        assert!(sanitize_reference("bad ref").is_err());
        assert!(sanitize_reference("").is_err());
        assert!(sanitize_reference(&"x".repeat(101)).is_err());
    }

    #[test]
    fn amount_rules() {
        let a = sanitize_amount(2.5, 1_000.0).unwrap();
        assert_eq!(a.koinu, 250_000_000);
        assert!(!a.warn);
        assert!(sanitize_amount(2_000.0, 1_000.0).unwrap().warn);
        assert!(sanitize_amount(0.0, 1_000.0).is_err());
        assert!(sanitize_amount(-5.0, 1_000.0).is_err());
        assert!(sanitize_amount(f64::NAN, 1_000.0).is_err());
        assert!(sanitize_amount(200_000_000.0, 1_000.0).is_err());
        // sub-koinu dust rounds to zero and is rejected
        assert!(sanitize_amount(0.000000001, 1_000.0).is_err());
    }

    #[test]
    fn address_shape_by_network() {
        let mainnet = format!("D{}", "9".repeat(30));
        assert!(sanitize_address(&mainnet, NetworkType::Mainnet).is_ok());
        assert!(sanitize_address(&mainnet, NetworkType::Testnet).is_err());
        // 'l' is not base58
        let bad = format!("D{}l{}", "9".repeat(15), "9".repeat(14));
        assert!(sanitize_address(&bad, NetworkType::Mainnet).is_err());
        assert!(sanitize_address("D123", NetworkType::Mainnet).is_err());
    }

    #[test]
    fn callback_url_ssrf_rules() {
        assert!(check_callback_url("https://pay.example.com/hook").is_ok());
        assert!(check_callback_url("https://pay.example.com:8443/hook").is_ok());
        assert!(check_callback_url("http://pay.example.com/hook").is_err());
        assert!(check_callback_url("https://127.0.0.1/hook").is_err());
        assert!(check_callback_url("https://[::1]/hook").is_err());
        assert!(check_callback_url("https://169.254.169.254/latest/meta-data").is_err());
        assert!(check_callback_url("https://localhost/hook").is_err());
        assert!(check_callback_url("https://metadata.google.internal/x").is_err());
        assert!(check_callback_url("https://internal.corp.local/x").is_err());
        assert!(check_callback_url("https://pay.example.com:9999/x").is_err());
        assert!(check_callback_url("not a url").is_err());
    }

    #[test]
    fn blocked_ip_ranges() {
        for ip in ["127.0.0.1", "10.1.2.3", "172.16.0.1", "192.168.1.1", "169.254.169.254", "100.64.0.1", "0.0.0.0"] {
            assert!(is_blocked_ip(ip.parse().unwrap()), "{ip}");
        }
        assert!(is_blocked_ip("::1".parse().unwrap()));
        assert!(is_blocked_ip("fe80::1".parse().unwrap()));
        assert!(is_blocked_ip("fd00::1".parse().unwrap()));
        assert!(!is_blocked_ip("93.184.216.34".parse().unwrap()));
        assert!(!is_blocked_ip("2606:2800:220:1::1".parse().unwrap()));
    }

    #[test]
    fn redaction_strips_sensitive_material() {
        let msg = format!(
            "failed to open /home/agent/.doged/keys/wallet.json (os error 13) key {}",
            "ab".repeat(32)
        );
        let out = redact_error(&msg);
        assert!(!out.contains("/home/agent"), "{out}");
        assert!(out.contains("[path]"));
        assert!(out.contains("os error [n]"));
        assert!(out.contains("[hex]"));
        assert!(out.len() <= REDACTED_MAX + 3);
    }

    #[test]
    fn redaction_truncates() {
        let out = redact_error(&"word ".repeat(100));
        assert!(out.len() <= REDACTED_MAX + 3);
    }

    fn limiter() -> (RateLimiter, ManualClock, TempDir) {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap());
        let limiter = RateLimiter::new(dir.path(), Arc::new(clock.clone()));
        (limiter, clock, dir)
    }

    #[test]
    fn rate_limiter_window_and_reset() {
        let (mut limiter, clock, _dir) = limiter();
        limiter.set_limit("op", RateLimit { max_requests: 2, window_ms: 1_000 });

        assert!(limiter.consume("op", None).allowed);
        let second = limiter.consume("op", None);
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = limiter.consume("op", None);
        assert!(!third.allowed);
        assert!(third.reset_in_ms <= 1_000);
        assert!(third.reason.is_some());

        clock.advance_ms(1_001);
        assert!(limiter.consume("op", None).allowed);
    }

    #[test]
    fn rate_limiter_scopes_by_subject() {
        let (mut limiter, _clock, _dir) = limiter();
        limiter.set_limit("op", RateLimit { max_requests: 1, window_ms: 60_000 });
        assert!(limiter.consume("op", Some("alice")).allowed);
        assert!(!limiter.consume("op", Some("alice")).allowed);
        assert!(limiter.consume("op", Some("bob")).allowed);
    }

    #[test]
    fn rate_limiter_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap());
        {
            let mut limiter = RateLimiter::new(dir.path(), Arc::new(clock.clone()));
            limiter.set_limit("op", RateLimit { max_requests: 1, window_ms: 600_000 });
            assert!(limiter.consume("op", None).allowed);
            limiter.persist();
        }
        let mut limiter = RateLimiter::new(dir.path(), Arc::new(clock));
        limiter.set_limit("op", RateLimit { max_requests: 1, window_ms: 600_000 });
        limiter.load().unwrap();
        assert!(!limiter.consume("op", None).allowed);
    }
}
