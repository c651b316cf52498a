use std::env;
use std::str::FromStr;

use crate::error::AppError;

/// How ready orders are offered to couriers. Exactly one policy is active
/// per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Offer to every eligible courier at once; first acceptance wins.
    Broadcast,
    /// Offer to one courier at a time; decline or expiry advances to the
    /// next candidate.
    Sequential,
}

impl FromStr for DispatchPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "broadcast" => Ok(DispatchPolicy::Broadcast),
            "sequential" => Ok(DispatchPolicy::Sequential),
            other => Err(format!("expected broadcast or sequential, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub dispatch_policy: DispatchPolicy,
    /// Seconds a courier has to answer an offer.
    pub offer_ttl_secs: i64,
    /// How many couriers a broadcast round fans out to.
    pub dispatch_fanout: usize,
    pub sweep_interval_secs: u64,
    pub otp_rate_limit_secs: i64,
    pub otp_expiry_secs: i64,
    pub otp_max_attempts: u32,
    pub otp_retention_hours: i64,
    /// Dev mode echoes the OTP code back in the request response.
    pub otp_dev_mode: bool,
    pub session_ttl_hours: i64,
    pub loyalty_points_per_delivery: u64,
    pub referral_points: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            event_buffer_size: 1024,
            dispatch_policy: DispatchPolicy::Broadcast,
            offer_ttl_secs: 120,
            dispatch_fanout: 5,
            sweep_interval_secs: 5,
            otp_rate_limit_secs: 60,
            otp_expiry_secs: 300,
            otp_max_attempts: 3,
            otp_retention_hours: 24,
            otp_dev_mode: false,
            session_ttl_hours: 24,
            loyalty_points_per_delivery: 10,
            referral_points: 25,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            dispatch_policy: parse_or_default("DISPATCH_POLICY", defaults.dispatch_policy)?,
            offer_ttl_secs: parse_or_default("OFFER_TTL_SECS", defaults.offer_ttl_secs)?,
            dispatch_fanout: parse_or_default("DISPATCH_FANOUT", defaults.dispatch_fanout)?,
            sweep_interval_secs: parse_or_default(
                "SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            )?,
            otp_rate_limit_secs: parse_or_default(
                "OTP_RATE_LIMIT_SECS",
                defaults.otp_rate_limit_secs,
            )?,
            otp_expiry_secs: parse_or_default("OTP_EXPIRY_SECS", defaults.otp_expiry_secs)?,
            otp_max_attempts: parse_or_default("OTP_MAX_ATTEMPTS", defaults.otp_max_attempts)?,
            otp_retention_hours: parse_or_default(
                "OTP_RETENTION_HOURS",
                defaults.otp_retention_hours,
            )?,
            otp_dev_mode: parse_or_default("OTP_DEV_MODE", defaults.otp_dev_mode)?,
            session_ttl_hours: parse_or_default("SESSION_TTL_HOURS", defaults.session_ttl_hours)?,
            loyalty_points_per_delivery: parse_or_default(
                "LOYALTY_POINTS_PER_DELIVERY",
                defaults.loyalty_points_per_delivery,
            )?,
            referral_points: parse_or_default("REFERRAL_POINTS", defaults.referral_points)?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
