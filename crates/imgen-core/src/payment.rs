//! Payment intents and bank-memo match tokens.
//!
//! A user announces a top-up by creating an intent; the bank transfer memo
//! carries the intent's match token (`PAY-7F3K9Q2M`) so the webhook can be
//! correlated back to it. Banks mangle memos freely (case, dashes, extra
//! words), so tokens are stored and looked up in a normalized form.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};
use crate::{PaymentIntentId, UserId};

/// Every match token starts with this marker.
pub const MATCH_TOKEN_PREFIX: &str = "PAY";

/// Length of the random part of generated tokens.
pub const MATCH_CODE_LEN: usize = 8;

// No 0/O, 1/I/L: memos are often typed by hand.
const CODE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKMNPQRSTUVWXYZ";

/// Lifecycle state of a payment intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    /// Waiting for a transfer.
    Pending,
    /// A transfer was accepted; the ledger credit is being applied.
    Matched,
    /// Ledger credited.
    Completed,
    /// Expired before a valid transfer arrived.
    Expired,
    /// A transfer arrived for less than the expected amount.
    Mismatched,
}

impl PaymentState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Mismatched)
    }

    /// Whether the state machine has an edge from `self` to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Matched | Self::Expired | Self::Mismatched)
                | (Self::Matched, Self::Completed)
        )
    }

    /// Name used in API responses and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Matched => "matched",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Mismatched => "mismatched",
        }
    }
}

/// An announced top-up waiting to be matched against a bank transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Intent identifier.
    pub id: PaymentIntentId,

    /// Whose account gets credited.
    pub owner_id: UserId,

    /// Credits granted on completion. Also the minimum accepted transfer.
    pub expected_amount: i64,

    /// Token the user puts in the transfer memo (`PAY-XXXXXXXX`).
    pub match_token: String,

    /// Current lifecycle state.
    pub state: PaymentState,

    /// Webhook event that matched this intent.
    pub matched_event_id: Option<String>,

    /// Amount actually transferred by the matching event.
    pub received_amount: Option<i64>,

    /// When the intent was created.
    pub created_at: DateTime<Utc>,

    /// After this instant the intent no longer accepts transfers.
    pub expires_at: DateTime<Utc>,

    /// When the ledger was credited.
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentIntent {
    /// Create a pending intent with a fresh match token.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` if `expected_amount` is not positive.
    pub fn new(owner_id: UserId, expected_amount: i64, ttl: Duration) -> Result<Self> {
        Self::with_token(owner_id, expected_amount, ttl, generate_match_token())
    }

    /// Create a pending intent with a caller-chosen token.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` for non-positive amounts, `InvalidRequest` if the
    /// token is not of the `PAY-XXXX` form.
    pub fn with_token(
        owner_id: UserId,
        expected_amount: i64,
        ttl: Duration,
        token: impl AsRef<str>,
    ) -> Result<Self> {
        if expected_amount <= 0 {
            return Err(BillingError::InvalidAmount(expected_amount));
        }
        let match_token = normalize_match_token(token.as_ref()).ok_or_else(|| {
            BillingError::InvalidRequest(format!("malformed match token: {}", token.as_ref()))
        })?;
        let now = Utc::now();
        Ok(Self {
            id: PaymentIntentId::generate(),
            owner_id,
            expected_amount,
            match_token,
            state: PaymentState::Pending,
            matched_event_id: None,
            received_amount: None,
            created_at: now,
            expires_at: now + ttl,
            completed_at: None,
        })
    }

    /// Whether the intent is past its deadline at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Move to `to`, stamping `completed_at` on completion.
    ///
    /// # Errors
    ///
    /// `IllegalPaymentTransition` if the edge does not exist.
    pub fn transition(&mut self, to: PaymentState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(BillingError::IllegalPaymentTransition {
                from: self.state,
                to,
            });
        }
        if to == PaymentState::Completed {
            self.completed_at = Some(now);
        }
        self.state = to;
        Ok(())
    }
}

/// Generate a fresh `PAY-XXXXXXXX` token.
#[must_use]
pub fn generate_match_token() -> String {
    // The low 62 bits of a v4 UUID carry no version or variant bits.
    let entropy = uuid::Uuid::new_v4().as_u128() & RANDOM_BITS_MASK;
    format!("{MATCH_TOKEN_PREFIX}-{}", encode_code(entropy))
}

const RANDOM_BITS_MASK: u128 = (1 << 62) - 1;

/// Spell `entropy` in base 31 over the code alphabet, least significant
/// digit first.
fn encode_code(mut entropy: u128) -> String {
    let radix = CODE_ALPHABET.len() as u128;
    (0..MATCH_CODE_LEN)
        .map(|_| {
            let digit = usize::try_from(entropy % radix).unwrap_or(0);
            entropy /= radix;
            char::from(CODE_ALPHABET[digit])
        })
        .collect()
}

/// Canonical form of a token as the user might type it.
///
/// `pay-abc123`, `PAY ABC123` and `PAYABC123` all normalize to `PAY-ABC123`.
#[must_use]
pub fn normalize_match_token(raw: &str) -> Option<String> {
    let compact: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let code = compact.strip_prefix(MATCH_TOKEN_PREFIX)?;
    if code.len() < 4 || code.len() > 16 {
        return None;
    }
    Some(format!("{MATCH_TOKEN_PREFIX}-{code}"))
}

/// Candidate match tokens found in a free-text bank memo, in order of
/// appearance.
///
/// After each `PAY` marker at most one separator is skipped and the following
/// alphanumeric run is taken as the code. When banks strip the space after
/// the code the run is too long, so a prefix of the generated length is
/// offered as well.
#[must_use]
pub fn extract_match_tokens(content: &str) -> Vec<String> {
    let upper: Vec<char> = content.chars().map(|c| c.to_ascii_uppercase()).collect();
    let marker: Vec<char> = MATCH_TOKEN_PREFIX.chars().collect();
    let mut tokens = Vec::new();

    let mut i = 0;
    while i + marker.len() <= upper.len() {
        let at_marker = upper[i..i + marker.len()] == marker[..];
        let word_start = i == 0 || !upper[i - 1].is_ascii_alphanumeric();
        if !(at_marker && word_start) {
            i += 1;
            continue;
        }

        let mut j = i + marker.len();
        if j < upper.len() && matches!(upper[j], '-' | '_' | ' ' | '.' | ':') {
            j += 1;
        }
        let start = j;
        while j < upper.len() && upper[j].is_ascii_alphanumeric() {
            j += 1;
        }
        let code: String = upper[start..j].iter().collect();

        for candidate in candidates(&code) {
            if let Some(token) = normalize_match_token(&format!("{MATCH_TOKEN_PREFIX}{candidate}")) {
                if !tokens.contains(&token) {
                    tokens.push(token);
                }
            }
        }
        i = j.max(i + 1);
    }
    tokens
}

fn candidates(code: &str) -> Vec<&str> {
    let mut out = vec![code];
    if code.len() > MATCH_CODE_LEN {
        out.push(&code[..MATCH_CODE_LEN]);
    }
    out
}
