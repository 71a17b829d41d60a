//! Payment webhook reconciliation.
//!
//! A top-up is announced as a [`PaymentIntent`] carrying a match token the
//! user puts in the transfer memo. The bank's webhook is matched back to the
//! intent by that token. Completion is two steps: `Pending -> Matched`, written
//! together with the webhook's idempotency record, then `Matched -> Completed`,
//! written together with the ledger credit. An intent stuck in `Matched` after
//! a crash is finished by [`PaymentReconciler::resume_matched`].
//!
//! The ledger is credited with the intent's `expected_amount`. Transfers below
//! it are rejected; any surplus is logged and not credited.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use imgen_core::{
    extract_match_tokens, EventKey, PaymentIntent, PaymentIntentId, PaymentState, UsageRecord,
    UserId,
};
use imgen_store::{IntentTransition, Store, StoreError};

use super::ReconcileError;
use crate::analytics::UsageReporter;

/// Attempts at drawing a match token that no other intent uses.
const TOKEN_ATTEMPTS: usize = 5;

/// Attempts at re-reading an intent that changed under us.
const STALE_RETRIES: usize = 3;

/// Result of one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The intent completed and the ledger was credited.
    Completed(PaymentIntent),
    /// The event, or a payment for the same intent, was already handled.
    AlreadyProcessed,
    /// No intent matched, or the amount was too low.
    Mismatched(String),
    /// The matched intent had expired. Nothing was credited.
    Expired,
}

impl WebhookOutcome {
    /// Short name for logs and responses.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::AlreadyProcessed => "already_processed",
            Self::Mismatched(_) => "mismatched",
            Self::Expired => "expired",
        }
    }
}

/// Matches payment webhooks to intents and credits the ledger.
pub struct PaymentReconciler {
    store: Arc<dyn Store>,
    intent_ttl: Duration,
    usage: UsageReporter,
}

impl PaymentReconciler {
    /// Create a reconciler issuing intents valid for `intent_ttl`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, intent_ttl: Duration, usage: UsageReporter) -> Self {
        Self {
            store,
            intent_ttl,
            usage,
        }
    }

    /// Announce a top-up of `amount` credits for `owner_id`.
    ///
    /// # Errors
    ///
    /// `Billing` for a non-positive amount. `Store` if persisting fails or
    /// every drawn match token collides.
    pub fn create_intent(
        &self,
        owner_id: UserId,
        amount: i64,
    ) -> Result<PaymentIntent, ReconcileError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let intent = PaymentIntent::new(owner_id, amount, self.intent_ttl)?;
            match self.store.create_payment_intent(&intent) {
                Ok(()) => {
                    tracing::info!(
                        intent_id = %intent.id,
                        user_id = %owner_id,
                        amount = amount,
                        match_token = %intent.match_token,
                        "Payment intent created"
                    );
                    return Ok(intent);
                }
                Err(StoreError::AlreadyExists { .. }) if attempt < TOKEN_ATTEMPTS => {
                    tracing::debug!(attempt = attempt, "Match token collision, drawing another");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Get an intent by ID.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub fn get_intent(&self, intent_id: &PaymentIntentId) -> Result<PaymentIntent, ReconcileError> {
        self.store
            .get_payment_intent(intent_id)?
            .ok_or_else(|| ReconcileError::NotFound(format!("payment intent {intent_id}")))
    }

    /// Handle one delivery of a payment webhook.
    ///
    /// Deliveries are at-least-once and may arrive out of order. Every
    /// outcome is recorded under `event_id`, so a replay always answers
    /// `AlreadyProcessed` and never touches the ledger.
    ///
    /// # Errors
    ///
    /// `Store` with `StaleTransition` if the intent keeps changing while
    /// the delivery is applied; the event stays unrecorded so a redelivery
    /// can retry. Other store failures propagate as is.
    pub fn handle_webhook(
        &self,
        event_id: &str,
        content: &str,
        transfer_amount: i64,
    ) -> Result<WebhookOutcome, ReconcileError> {
        let event = EventKey::payment(event_id);
        if self.store.has_event(&event)? {
            tracing::debug!(event_id = %event_id, "Payment event already processed");
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let Some(mut intent) = self.find_intent(content)? else {
            tracing::warn!(event_id = %event_id, amount = transfer_amount, "No payment intent matches transfer memo");
            return self.record_noop(&event, WebhookOutcome::Mismatched("no matching intent".into()));
        };

        for _ in 0..STALE_RETRIES {
            match self.settle(&intent, &event, transfer_amount) {
                Err(ReconcileError::Store(StoreError::StaleTransition { .. })) => {
                    intent = self.get_intent(&intent.id)?;
                }
                Err(ReconcileError::Store(StoreError::DuplicateEvent { .. })) => {
                    return Ok(WebhookOutcome::AlreadyProcessed);
                }
                other => return other,
            }
        }
        // The intent keeps changing under us; leave the event unrecorded so a
        // redelivery gets another chance.
        Err(ReconcileError::Store(StoreError::StaleTransition {
            entity: "payment intent",
            expected: PaymentState::Pending.as_str(),
            actual: intent.state.as_str(),
        }))
    }

    /// Finish every intent left in `Matched`. Returns how many completed.
    ///
    /// # Errors
    ///
    /// Fails only if the open intents cannot be listed.
    pub fn resume_matched(&self) -> Result<usize, ReconcileError> {
        let mut completed = 0;
        for intent in self.store.list_open_intents()? {
            if intent.state != PaymentState::Matched {
                continue;
            }
            match self.complete(&intent.id) {
                Ok(_) => completed += 1,
                Err(ReconcileError::Store(StoreError::StaleTransition { .. })) => {}
                Err(e) => {
                    tracing::error!(intent_id = %intent.id, error = %e, "Failed to complete matched intent");
                }
            }
        }
        Ok(completed)
    }

    /// Expire every `Pending` intent past its deadline. Returns how many.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn expire_intents(&self, now: DateTime<Utc>) -> Result<usize, ReconcileError> {
        let mut expired = 0;
        for intent in self.store.list_open_intents()? {
            if intent.state != PaymentState::Pending || !intent.is_expired_at(now) {
                continue;
            }
            let transition = IntentTransition {
                to: PaymentState::Expired,
                event: None,
                received_amount: None,
            };
            match self
                .store
                .transition_payment_intent(&intent.id, PaymentState::Pending, &transition)
            {
                Ok(_) => expired += 1,
                Err(StoreError::StaleTransition { .. }) => {}
                Err(e) => {
                    tracing::error!(intent_id = %intent.id, error = %e, "Failed to expire intent");
                }
            }
        }
        if expired > 0 {
            tracing::info!(count = expired, "Expired payment intents");
        }
        Ok(expired)
    }

    fn find_intent(&self, content: &str) -> Result<Option<PaymentIntent>, ReconcileError> {
        for token in extract_match_tokens(content) {
            if let Some(intent) = self.store.get_payment_intent_by_token(&token)? {
                return Ok(Some(intent));
            }
        }
        Ok(None)
    }

    fn settle(
        &self,
        intent: &PaymentIntent,
        event: &EventKey,
        transfer_amount: i64,
    ) -> Result<WebhookOutcome, ReconcileError> {
        let event_id = event.external_id.as_str();
        match intent.state {
            PaymentState::Completed | PaymentState::Matched => {
                tracing::warn!(
                    intent_id = %intent.id,
                    event_id = %event_id,
                    amount = transfer_amount,
                    "Second transfer for an already paid intent, not credited"
                );
                self.record_noop(event, WebhookOutcome::AlreadyProcessed)
            }
            PaymentState::Expired => {
                tracing::warn!(
                    intent_id = %intent.id,
                    event_id = %event_id,
                    amount = transfer_amount,
                    "Transfer arrived for an expired intent, not credited"
                );
                self.record_noop(event, WebhookOutcome::Expired)
            }
            PaymentState::Mismatched => {
                self.record_noop(event, WebhookOutcome::Mismatched("intent already rejected".into()))
            }
            PaymentState::Pending if intent.is_expired_at(Utc::now()) => {
                self.close(intent, PaymentState::Expired, event, transfer_amount)?;
                tracing::warn!(
                    intent_id = %intent.id,
                    event_id = %event_id,
                    "Transfer arrived after the intent deadline, not credited"
                );
                Ok(WebhookOutcome::Expired)
            }
            PaymentState::Pending if transfer_amount < intent.expected_amount => {
                self.close(intent, PaymentState::Mismatched, event, transfer_amount)?;
                tracing::warn!(
                    intent_id = %intent.id,
                    event_id = %event_id,
                    expected = intent.expected_amount,
                    received = transfer_amount,
                    "Underpayment, intent rejected"
                );
                Ok(WebhookOutcome::Mismatched(format!(
                    "expected {}, received {transfer_amount}",
                    intent.expected_amount
                )))
            }
            PaymentState::Pending => {
                self.close(intent, PaymentState::Matched, event, transfer_amount)?;
                if transfer_amount > intent.expected_amount {
                    tracing::warn!(
                        intent_id = %intent.id,
                        expected = intent.expected_amount,
                        received = transfer_amount,
                        surplus = transfer_amount - intent.expected_amount,
                        "Overpayment, crediting the expected amount only"
                    );
                }
                match self.complete(&intent.id) {
                    Ok(completed) => Ok(WebhookOutcome::Completed(completed)),
                    // The worker's resume sweep finished it first.
                    Err(ReconcileError::Store(StoreError::StaleTransition { .. })) => {
                        Ok(WebhookOutcome::Completed(self.get_intent(&intent.id)?))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn close(
        &self,
        intent: &PaymentIntent,
        to: PaymentState,
        event: &EventKey,
        transfer_amount: i64,
    ) -> Result<PaymentIntent, ReconcileError> {
        let transition = IntentTransition {
            to,
            event: Some(event.clone()),
            received_amount: Some(transfer_amount),
        };
        Ok(self
            .store
            .transition_payment_intent(&intent.id, PaymentState::Pending, &transition)?)
    }

    fn complete(&self, intent_id: &PaymentIntentId) -> Result<PaymentIntent, ReconcileError> {
        let (intent, account) = self.store.complete_payment_intent(intent_id)?;
        tracing::info!(
            intent_id = %intent.id,
            user_id = %intent.owner_id,
            amount = intent.expected_amount,
            balance = account.balance,
            "Payment credited"
        );
        self.usage.report(UsageRecord::for_payment(&intent));
        Ok(intent)
    }

    fn record_noop(
        &self,
        event: &EventKey,
        outcome: WebhookOutcome,
    ) -> Result<WebhookOutcome, ReconcileError> {
        if self.store.record_event(event)? {
            Ok(outcome)
        } else {
            Ok(WebhookOutcome::AlreadyProcessed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgen_core::CreditSource;
    use imgen_store::RocksStore;
    use tempfile::TempDir;

    struct Fixture {
        store: Arc<RocksStore>,
        reconciler: PaymentReconciler,
        user_id: UserId,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let reconciler =
            PaymentReconciler::new(store.clone(), Duration::minutes(15), UsageReporter::default());
        Fixture {
            store,
            reconciler,
            user_id: UserId::generate(),
            _dir: dir,
        }
    }

    impl Fixture {
        fn intent_with_token(&self, amount: i64, token: &str) -> PaymentIntent {
            let intent =
                PaymentIntent::with_token(self.user_id, amount, Duration::minutes(15), token).unwrap();
            self.store.create_payment_intent(&intent).unwrap();
            intent
        }

        fn balance(&self) -> i64 {
            self.store
                .get_account(&self.user_id)
                .unwrap()
                .map_or(0, |a| a.balance)
        }
    }

    #[test]
    fn matching_transfer_credits_once() {
        let f = fixture();
        let intent = f.intent_with_token(50_000, "PAY-ABC123");

        let outcome = f
            .reconciler
            .handle_webhook("evt-1", "CT DEN 0123 PAY-ABC123 nap tien", 50_000)
            .unwrap();
        match outcome {
            WebhookOutcome::Completed(done) => {
                assert_eq!(done.id, intent.id);
                assert_eq!(done.state, PaymentState::Completed);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(f.balance(), 50_000);

        for _ in 0..100 {
            assert_eq!(
                f.reconciler
                    .handle_webhook("evt-1", "CT DEN 0123 PAY-ABC123 nap tien", 50_000)
                    .unwrap(),
                WebhookOutcome::AlreadyProcessed
            );
        }
        assert_eq!(f.balance(), 50_000);
    }

    #[test]
    fn second_distinct_transfer_is_not_credited() {
        let f = fixture();
        f.intent_with_token(1_000, "PAY-TWICE001");

        f.reconciler
            .handle_webhook("evt-a", "PAY-TWICE001", 1_000)
            .unwrap();
        let outcome = f
            .reconciler
            .handle_webhook("evt-b", "PAY-TWICE001", 1_000)
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::AlreadyProcessed);
        assert_eq!(f.balance(), 1_000);
    }

    #[test]
    fn memo_without_dash_and_in_lowercase_matches() {
        let f = fixture();
        f.intent_with_token(500, "PAY-7F3K9Q2M");

        let outcome = f
            .reconciler
            .handle_webhook("evt-lc", "chuyen tien pay7f3k9q2m.", 500)
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Completed(_)));
        assert_eq!(f.balance(), 500);
    }

    #[test]
    fn unknown_token_is_mismatched_and_recorded() {
        let f = fixture();
        let outcome = f
            .reconciler
            .handle_webhook("evt-x", "PAY-NOBODY99", 100)
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Mismatched(_)));
        assert_eq!(
            f.reconciler
                .handle_webhook("evt-x", "PAY-NOBODY99", 100)
                .unwrap(),
            WebhookOutcome::AlreadyProcessed
        );
    }

    #[test]
    fn underpayment_rejects_intent_without_credit() {
        let f = fixture();
        let intent = f.intent_with_token(1_000, "PAY-UNDER001");

        let outcome = f
            .reconciler
            .handle_webhook("evt-u", "PAY-UNDER001", 999)
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Mismatched(_)));
        assert_eq!(f.balance(), 0);

        let intent = f.reconciler.get_intent(&intent.id).unwrap();
        assert_eq!(intent.state, PaymentState::Mismatched);
        assert_eq!(intent.received_amount, Some(999));
    }

    #[test]
    fn overpayment_credits_expected_amount() {
        let f = fixture();
        f.intent_with_token(1_000, "PAY-OVER0001");

        let outcome = f
            .reconciler
            .handle_webhook("evt-o", "PAY-OVER0001", 5_000)
            .unwrap();
        match outcome {
            WebhookOutcome::Completed(intent) => assert_eq!(intent.received_amount, Some(5_000)),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(f.balance(), 1_000);
    }

    #[test]
    fn late_transfer_for_expired_intent_is_surfaced() {
        let f = fixture();
        let intent = PaymentIntent::with_token(f.user_id, 700, Duration::seconds(-1), "PAY-LATE0001")
            .unwrap();
        f.store.create_payment_intent(&intent).unwrap();

        let outcome = f
            .reconciler
            .handle_webhook("evt-late", "PAY-LATE0001", 700)
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Expired);
        assert_eq!(f.balance(), 0);
        assert_eq!(
            f.reconciler.get_intent(&intent.id).unwrap().state,
            PaymentState::Expired
        );
    }

    #[test]
    fn sweep_expires_pending_intents() {
        let f = fixture();
        let intent = f.intent_with_token(300, "PAY-SWEEP001");

        assert_eq!(f.reconciler.expire_intents(Utc::now()).unwrap(), 0);
        let later = Utc::now() + Duration::hours(1);
        assert_eq!(f.reconciler.expire_intents(later).unwrap(), 1);
        assert_eq!(
            f.reconciler.get_intent(&intent.id).unwrap().state,
            PaymentState::Expired
        );

        let outcome = f
            .reconciler
            .handle_webhook("evt-s", "PAY-SWEEP001", 300)
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Expired);
        assert_eq!(f.balance(), 0);
    }

    #[test]
    fn matched_intent_is_resumed() {
        let f = fixture();
        let intent = f.intent_with_token(400, "PAY-RESUME01");
        f.store
            .transition_payment_intent(
                &intent.id,
                PaymentState::Pending,
                &IntentTransition {
                    to: PaymentState::Matched,
                    event: Some(EventKey::payment("evt-crash")),
                    received_amount: Some(400),
                },
            )
            .unwrap();

        assert_eq!(f.reconciler.resume_matched().unwrap(), 1);
        assert_eq!(f.reconciler.resume_matched().unwrap(), 0);
        assert_eq!(f.balance(), 400);
        assert_eq!(
            f.reconciler
                .handle_webhook("evt-crash", "PAY-RESUME01", 400)
                .unwrap(),
            WebhookOutcome::AlreadyProcessed
        );
    }

    #[test]
    fn create_intent_issues_distinct_tokens() {
        let f = fixture();
        let a = f.reconciler.create_intent(f.user_id, 100).unwrap();
        let b = f.reconciler.create_intent(f.user_id, 100).unwrap();
        assert_ne!(a.match_token, b.match_token);
        assert!(a.match_token.starts_with("PAY-"));
        assert!(matches!(
            f.reconciler.create_intent(f.user_id, 0),
            Err(ReconcileError::Billing(_))
        ));
    }

    #[test]
    fn concurrent_deliveries_credit_once() {
        let f = fixture();
        f.intent_with_token(2_500, "PAY-RACE0002");
        let reconciler = &f.reconciler;

        std::thread::scope(|s| {
            for i in 0..8 {
                s.spawn(move || {
                    // Half replay one event id, half are distinct transfers.
                    let event_id = if i % 2 == 0 { "evt-r".to_string() } else { format!("evt-r{i}") };
                    reconciler
                        .handle_webhook(&event_id, "PAY-RACE0002", 2_500)
                        .unwrap();
                });
            }
        });

        assert_eq!(f.balance(), 2_500);
    }
}
