// src/store.rs
use crate::error::AppResult;
use crate::models::{
    PaymentAttempt, Rate, Scheme, Subscription, SubscriptionStatus, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    pub user_id: Option<Uuid>,
    pub status: Option<SubscriptionStatus>,
}

/// The `$set` of an administrative status update. Applied only if the stored
/// version still equals `expected_version`.
#[derive(Clone, Debug)]
pub struct StatusChange {
    pub subscription_id: Uuid,
    pub expected_version: i64,
    pub status: SubscriptionStatus,
    pub initial_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KycVerification {
    pub user_id: Uuid,
    pub verified: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusUpdateOutcome {
    Applied,
    /// Zero subscription rows matched; nothing was written.
    NotModified,
    /// The KYC target vanished; the whole change was rolled back.
    UserMissing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    Applied,
    /// This subscription already holds the payment id.
    AlreadySettled,
    /// A different subscription holds the payment id.
    ClaimedElsewhere,
    /// No pending attempt for the order id, or no such subscription.
    UnknownOrder,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_user(&self, user: &User) -> AppResult<()>;
    async fn find_user(&self, id: Uuid) -> AppResult<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>>;
    async fn find_user_by_phone(&self, phone_number: &str) -> AppResult<Option<User>>;
    async fn find_user_by_username(&self, username: &str) -> AppResult<Option<User>>;
    /// Overwrites every mutable column. Returns false if the user does not exist.
    async fn save_user(&self, user: &User) -> AppResult<bool>;
    async fn delete_user(&self, id: Uuid) -> AppResult<bool>;

    async fn insert_scheme(&self, scheme: &Scheme) -> AppResult<()>;
    async fn find_scheme(&self, id: Uuid) -> AppResult<Option<Scheme>>;
    async fn list_schemes(&self) -> AppResult<Vec<Scheme>>;

    async fn insert_rate(&self, rate: &Rate) -> AppResult<()>;
    async fn latest_rate(&self) -> AppResult<Option<Rate>>;

    async fn insert_subscription(&self, subscription: &Subscription) -> AppResult<()>;
    async fn find_subscription(&self, id: Uuid) -> AppResult<Option<Subscription>>;
    async fn list_subscriptions(&self, filter: &SubscriptionFilter)
    -> AppResult<Vec<Subscription>>;
    /// Appends a pending attempt. Returns false if the subscription does not exist.
    async fn append_payment(&self, subscription_id: Uuid, attempt: &PaymentAttempt)
    -> AppResult<bool>;
    /// Appends a completed attempt and activates the subscription, provided the
    /// subscription holds a pending attempt for `attempt.order_id` and no
    /// subscription has settled `attempt.payment_id` yet.
    async fn settle_payment(
        &self,
        subscription_id: Uuid,
        attempt: &PaymentAttempt,
    ) -> AppResult<SettleOutcome>;
    /// Applies `change` and, when given, the KYC flag, as one unit.
    async fn apply_status_update(
        &self,
        change: &StatusChange,
        kyc: Option<KycVerification>,
    ) -> AppResult<StatusUpdateOutcome>;
}

#[cfg(test)]
pub mod memory {
    use super::*;
    use crate::error::AppError;
    use crate::models::PaymentStatus;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        users: Vec<User>,
        schemes: Vec<Scheme>,
        rates: Vec<Rate>,
        subscriptions: Vec<Subscription>,
        broken_users: HashSet<Uuid>,
    }

    /// Vec-backed store preserving insertion order, like a heap-ordered collection scan.
    #[derive(Default)]
    pub struct MemoryStore {
        state: Mutex<State>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes every lookup of `id` fail as a storage fault.
        pub fn break_user(&self, id: Uuid) {
            self.state.lock().unwrap().broken_users.insert(id);
        }

        pub fn user(&self, id: Uuid) -> Option<User> {
            self.state
                .lock()
                .unwrap()
                .users
                .iter()
                .find(|u| u.id == id)
                .cloned()
        }

        pub fn subscription(&self, id: Uuid) -> Option<Subscription> {
            self.state
                .lock()
                .unwrap()
                .subscriptions
                .iter()
                .find(|s| s.id == id)
                .cloned()
        }

        /// Simulates another writer committing in between a read and an update.
        pub fn bump_version(&self, id: Uuid) {
            let mut state = self.state.lock().unwrap();
            if let Some(s) = state.subscriptions.iter_mut().find(|s| s.id == id) {
                s.version += 1;
            }
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn insert_user(&self, user: &User) -> AppResult<()> {
            let mut state = self.state.lock().unwrap();
            if state
                .users
                .iter()
                .any(|u| {
                    u.username == user.username
                        || u.email == user.email
                        || u.phone_number == user.phone_number
                })
            {
                return Err(AppError::Conflict("Resource already exists".into()));
            }
            state.users.push(user.clone());
            Ok(())
        }

        async fn find_user(&self, id: Uuid) -> AppResult<Option<User>> {
            let state = self.state.lock().unwrap();
            if state.broken_users.contains(&id) {
                return Err(AppError::Internal("connection reset".into()));
            }
            Ok(state.users.iter().find(|u| u.id == id).cloned())
        }

        async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>> {
            let state = self.state.lock().unwrap();
            Ok(state.users.iter().find(|u| u.email == email).cloned())
        }

        async fn find_user_by_phone(&self, phone_number: &str) -> AppResult<Option<User>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .users
                .iter()
                .find(|u| u.phone_number == phone_number)
                .cloned())
        }

        async fn find_user_by_username(&self, username: &str) -> AppResult<Option<User>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .users
                .iter()
                .find(|u| u.username == username)
                .cloned())
        }

        async fn save_user(&self, user: &User) -> AppResult<bool> {
            let mut state = self.state.lock().unwrap();
            match state.users.iter_mut().find(|u| u.id == user.id) {
                Some(existing) => {
                    *existing = user.clone();
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn delete_user(&self, id: Uuid) -> AppResult<bool> {
            let mut state = self.state.lock().unwrap();
            let before = state.users.len();
            state.users.retain(|u| u.id != id);
            Ok(state.users.len() != before)
        }

        async fn insert_scheme(&self, scheme: &Scheme) -> AppResult<()> {
            self.state.lock().unwrap().schemes.push(scheme.clone());
            Ok(())
        }

        async fn find_scheme(&self, id: Uuid) -> AppResult<Option<Scheme>> {
            let state = self.state.lock().unwrap();
            Ok(state.schemes.iter().find(|s| s.id == id).cloned())
        }

        async fn list_schemes(&self) -> AppResult<Vec<Scheme>> {
            Ok(self.state.lock().unwrap().schemes.clone())
        }

        async fn insert_rate(&self, rate: &Rate) -> AppResult<()> {
            self.state.lock().unwrap().rates.push(rate.clone());
            Ok(())
        }

        async fn latest_rate(&self) -> AppResult<Option<Rate>> {
            let state = self.state.lock().unwrap();
            Ok(state.rates.iter().max_by_key(|r| r.created_at).cloned())
        }

        async fn insert_subscription(&self, subscription: &Subscription) -> AppResult<()> {
            self.state
                .lock()
                .unwrap()
                .subscriptions
                .push(subscription.clone());
            Ok(())
        }

        async fn find_subscription(&self, id: Uuid) -> AppResult<Option<Subscription>> {
            Ok(self.subscription(id))
        }

        async fn list_subscriptions(
            &self,
            filter: &SubscriptionFilter,
        ) -> AppResult<Vec<Subscription>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .subscriptions
                .iter()
                .filter(|s| {
                    filter.user_id.is_none_or(|u| s.user_id == u)
                        && filter.status.is_none_or(|st| s.status == st)
                })
                .cloned()
                .collect())
        }

        async fn append_payment(
            &self,
            subscription_id: Uuid,
            attempt: &PaymentAttempt,
        ) -> AppResult<bool> {
            let mut state = self.state.lock().unwrap();
            match state
                .subscriptions
                .iter_mut()
                .find(|s| s.id == subscription_id)
            {
                Some(s) => {
                    s.payments.push(attempt.clone());
                    s.updated_at = Utc::now();
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn settle_payment(
            &self,
            subscription_id: Uuid,
            attempt: &PaymentAttempt,
        ) -> AppResult<SettleOutcome> {
            let Some(payment_id) = attempt.payment_id.as_deref() else {
                return Err(AppError::Internal("settlement without payment id".into()));
            };
            let mut state = self.state.lock().unwrap();
            if let Some(holder) = state
                .subscriptions
                .iter()
                .find(|s| s.is_settled_by(payment_id))
            {
                return Ok(if holder.id == subscription_id {
                    SettleOutcome::AlreadySettled
                } else {
                    SettleOutcome::ClaimedElsewhere
                });
            }
            let Some(s) = state
                .subscriptions
                .iter_mut()
                .find(|s| s.id == subscription_id && s.has_pending_order(&attempt.order_id))
            else {
                return Ok(SettleOutcome::UnknownOrder);
            };
            debug_assert_eq!(attempt.status, PaymentStatus::Completed);
            s.payments.push(attempt.clone());
            s.status = SubscriptionStatus::Active;
            s.updated_at = Utc::now();
            s.version += 1;
            Ok(SettleOutcome::Applied)
        }

        async fn apply_status_update(
            &self,
            change: &StatusChange,
            kyc: Option<KycVerification>,
        ) -> AppResult<StatusUpdateOutcome> {
            let mut state = self.state.lock().unwrap();
            if let Some(k) = kyc {
                if !state.users.iter().any(|u| u.id == k.user_id) {
                    return Ok(StatusUpdateOutcome::UserMissing);
                }
            }
            let Some(s) = state.subscriptions.iter_mut().find(|s| {
                s.id == change.subscription_id && s.version == change.expected_version
            }) else {
                return Ok(StatusUpdateOutcome::NotModified);
            };
            s.status = change.status;
            s.initial_date = Some(change.initial_date);
            s.end_date = Some(change.end_date);
            s.due_date = change.due_date;
            s.updated_at = Utc::now();
            s.version += 1;
            if let Some(k) = kyc {
                if let Some(u) = state.users.iter_mut().find(|u| u.id == k.user_id) {
                    u.is_verified_kyc = k.verified;
                    u.updated_at = Utc::now();
                }
            }
            Ok(StatusUpdateOutcome::Applied)
        }
    }
}
