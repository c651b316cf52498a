use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::engine::lifecycle::numeric_code;
use crate::error::AppError;
use crate::models::account::{CustomerAccount, ReferralEntry, Session};
use crate::models::otp::{OtpChallenge, OtpKind};
use crate::state::AppState;
use crate::store::OtpStore;

const OTP_CODE_DIGITS: u32 = 6;
const REFERRAL_CODE_LEN: usize = 8;

#[derive(Debug, Serialize)]
pub struct OtpReceipt {
    pub challenge_id: Uuid,
    pub expires_at: DateTime<Utc>,
    /// Only populated when `otp_dev_mode` is on; production responses never
    /// carry the code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyOutcome {
    pub token: Uuid,
    pub customer_id: Uuid,
    pub is_new_account: bool,
    pub expires_at: DateTime<Utc>,
}

/// Issues a fresh challenge for the phone, rate-limited to one per
/// `otp_rate_limit_secs`. Any prior unused challenge dies with the insert.
pub async fn request_code(
    state: &AppState,
    phone: &str,
    kind: OtpKind,
) -> Result<OtpReceipt, AppError> {
    validate_phone(phone)?;
    let now = Utc::now();

    let code = numeric_code(OTP_CODE_DIGITS);
    let challenge = OtpChallenge {
        id: Uuid::new_v4(),
        phone: phone.to_string(),
        code: code.clone(),
        kind,
        expires_at: now + Duration::seconds(state.config.otp_expiry_secs),
        is_used: false,
        attempts: 0,
        max_attempts: state.config.otp_max_attempts,
        created_at: now,
    };
    let window = Duration::seconds(state.config.otp_rate_limit_secs);
    if let Err(retry_after_secs) = state
        .store
        .insert_challenge(challenge.clone(), window)
        .await
    {
        state
            .metrics
            .otp_requests_total
            .with_label_values(&["rate_limited"])
            .inc();
        return Err(AppError::RateLimited { retry_after_secs });
    }

    // Fire and forget; delivery failure never rolls back the challenge.
    let sms = state.sms.clone();
    let phone_owned = phone.to_string();
    let message = format!("Your verification code is {code}");
    tokio::spawn(async move {
        sms.send(&phone_owned, &message).await;
    });

    state
        .metrics
        .otp_requests_total
        .with_label_values(&["success"])
        .inc();
    info!(phone, challenge_id = %challenge.id, "otp challenge created");

    Ok(OtpReceipt {
        challenge_id: challenge.id,
        expires_at: challenge.expires_at,
        dev_code: state.config.otp_dev_mode.then_some(code),
    })
}

/// Verifies the newest live challenge for the phone. On success the
/// challenge is consumed, the account is created if absent (crediting a
/// referral when one applies) and a session token is minted.
pub async fn verify_code(
    state: &AppState,
    phone: &str,
    code: &str,
    referral_code: Option<String>,
) -> Result<VerifyOutcome, AppError> {
    validate_phone(phone)?;
    let now = Utc::now();

    let challenge = state
        .store
        .latest_challenge(phone)
        .await
        .filter(|c| c.is_live_at(now))
        .ok_or_else(|| {
            state
                .metrics
                .otp_verifications_total
                .with_label_values(&["no_challenge"])
                .inc();
            AppError::NoActiveChallenge
        })?;

    if challenge.attempts_exhausted() {
        state
            .metrics
            .otp_verifications_total
            .with_label_values(&["max_attempts"])
            .inc();
        return Err(AppError::MaxAttemptsExceeded);
    }

    if challenge.code != code {
        let attempts = state
            .store
            .increment_attempts(challenge.id)
            .await
            .unwrap_or(challenge.max_attempts);
        if attempts >= challenge.max_attempts {
            state
                .metrics
                .otp_verifications_total
                .with_label_values(&["max_attempts"])
                .inc();
            return Err(AppError::MaxAttemptsExceeded);
        }
        state
            .metrics
            .otp_verifications_total
            .with_label_values(&["invalid_code"])
            .inc();
        return Err(AppError::InvalidCode {
            attempts_remaining: challenge.max_attempts - attempts,
        });
    }

    state.store.mark_challenge_used(challenge.id).await;

    let (account, is_new_account) = find_or_create_account(state, phone, now);
    if is_new_account {
        credit_referral(state, &account, referral_code.as_deref(), now);
    }

    let session = Session {
        token: Uuid::new_v4(),
        customer_id: account.id,
        issued_at: now,
        expires_at: now + Duration::hours(state.config.session_ttl_hours),
    };
    state.sessions.insert(session.token, session.clone());

    state
        .metrics
        .otp_verifications_total
        .with_label_values(&["success"])
        .inc();
    info!(phone, customer_id = %account.id, is_new_account, "otp verified");

    Ok(VerifyOutcome {
        token: session.token,
        customer_id: account.id,
        is_new_account,
        expires_at: session.expires_at,
    })
}

/// Valid while unexpired and not revoked.
pub async fn check_session(state: &AppState, token: Uuid) -> Result<Session, AppError> {
    let now = Utc::now();
    let session = state
        .sessions
        .get(&token)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::Forbidden("unknown session".to_string()))?;

    if now >= session.expires_at {
        return Err(AppError::Forbidden("session expired".to_string()));
    }
    if state.revocations.is_revoked(token, now).await {
        return Err(AppError::Forbidden("session revoked".to_string()));
    }
    Ok(session)
}

/// Revokes the token for the remainder of its natural lifetime, through the
/// shared revocation store so every instance sees it.
pub async fn logout(state: &AppState, token: Uuid) -> Result<(), AppError> {
    let session = state
        .sessions
        .get(&token)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound("unknown session".to_string()))?;

    state.revocations.revoke(token, session.expires_at).await;
    info!(customer_id = %session.customer_id, "session revoked");
    Ok(())
}

fn find_or_create_account(
    state: &AppState,
    phone: &str,
    now: DateTime<Utc>,
) -> (CustomerAccount, bool) {
    if let Some(existing) = state.accounts.get(phone) {
        return (existing.value().clone(), false);
    }

    let account = CustomerAccount {
        id: Uuid::new_v4(),
        phone: phone.to_string(),
        loyalty_points: 0,
        referral_code: referral_code(),
        created_at: now,
    };
    state.accounts.insert(phone.to_string(), account.clone());
    (account, true)
}

fn credit_referral(
    state: &AppState,
    referred: &CustomerAccount,
    referral_code: Option<&str>,
    now: DateTime<Utc>,
) {
    let Some(code) = referral_code else {
        return;
    };

    let referrer = state
        .accounts
        .iter()
        .find(|entry| entry.value().referral_code == code)
        .map(|entry| entry.value().clone());
    let Some(referrer) = referrer else {
        info!(code, "unknown referral code, ignoring");
        return;
    };
    if referrer.id == referred.id {
        return;
    }

    // Keyed by referred id: a second entry for the same user is impossible.
    if state.referrals.contains_key(&referred.id) {
        return;
    }
    state.referrals.insert(
        referred.id,
        ReferralEntry {
            referrer_id: referrer.id,
            referred_id: referred.id,
            points: state.config.referral_points,
            created_at: now,
        },
    );

    if let Some(mut account) = state.accounts.get_mut(&referrer.phone) {
        account.value_mut().loyalty_points += state.config.referral_points;
    }
    info!(referrer_id = %referrer.id, referred_id = %referred.id, "referral credited");
}

fn validate_phone(phone: &str) -> Result<(), AppError> {
    let valid = phone.strip_prefix('+').is_some_and(|digits| {
        (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
    });
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "phone must be E.164 formatted, got {phone}"
        )))
    }
}

fn referral_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REFERRAL_CODE_LEN)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::validate_phone;

    #[test]
    fn phone_validation_accepts_e164() {
        assert!(validate_phone("+2250700000000").is_ok());
        assert!(validate_phone("+14155550100").is_ok());
    }

    #[test]
    fn phone_validation_rejects_garbage() {
        assert!(validate_phone("0700000000").is_err());
        assert!(validate_phone("+07abc").is_err());
        assert!(validate_phone("+1").is_err());
        assert!(validate_phone("").is_err());
    }
}
