// src/db.rs
use crate::error::{AppError, AppResult};
use crate::models::{
    Address, BankDetails, KycDocuments, PaymentAttempt, Rate, Scheme, Subscription, User,
};
use crate::store::{
    KycVerification, SettleOutcome, StatusChange, StatusUpdateOutcome, Store, SubscriptionFilter,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

const USER_COLUMNS: &str = "id, username, fullname, phone_number, email, password_hash, \
    referral_code, role, otp, token, token_created_at, address, bank_details, \
    aadhaar_number, pan_number, kyc, is_verified_kyc, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, kind, user_id, scheme_id, status, initial_amount, \
    weight, initial_date, end_date, due_date, payments, version, created_at, updated_at";

fn parse<T: FromStr<Err = String>>(value: &str) -> AppResult<T> {
    value.parse().map_err(|e: String| {
        tracing::error!("Corrupt row: {}", e);
        AppError::Internal(e)
    })
}

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    fullname: String,
    phone_number: String,
    email: String,
    password_hash: String,
    referral_code: Option<String>,
    role: String,
    otp: Option<String>,
    token: Option<String>,
    token_created_at: Option<DateTime<Utc>>,
    address: Option<Json<Address>>,
    bank_details: Option<Json<BankDetails>>,
    aadhaar_number: Option<String>,
    pan_number: Option<String>,
    kyc: Option<Json<KycDocuments>>,
    is_verified_kyc: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = AppError;

    fn try_from(row: UserRow) -> AppResult<Self> {
        Ok(User {
            id: row.id,
            username: row.username,
            fullname: row.fullname,
            phone_number: row.phone_number,
            email: row.email,
            password_hash: row.password_hash,
            referral_code: row.referral_code,
            role: parse(&row.role)?,
            otp: row.otp,
            token: row.token,
            token_created_at: row.token_created_at,
            address: row.address.map(|j| j.0),
            bank_details: row.bank_details.map(|j| j.0),
            aadhaar_number: row.aadhaar_number,
            pan_number: row.pan_number,
            kyc: row.kyc.map(|j| j.0),
            is_verified_kyc: row.is_verified_kyc,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct SchemeRow {
    id: Uuid,
    name: String,
    scheme_type: String,
    contribution_mode: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<SchemeRow> for Scheme {
    type Error = AppError;

    fn try_from(row: SchemeRow) -> AppResult<Self> {
        Ok(Scheme {
            id: row.id,
            name: row.name,
            scheme_type: parse(&row.scheme_type)?,
            contribution_mode: row.contribution_mode.as_deref().map(parse).transpose()?,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct RateRow {
    id: Uuid,
    gold_rate: f64,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct SubscriptionRow {
    id: Uuid,
    kind: String,
    user_id: Uuid,
    scheme_id: Uuid,
    status: String,
    initial_amount: f64,
    weight: Option<f64>,
    initial_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    due_date: Option<DateTime<Utc>>,
    payments: Json<Vec<PaymentAttempt>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = AppError;

    fn try_from(row: SubscriptionRow) -> AppResult<Self> {
        Ok(Subscription {
            id: row.id,
            kind: parse(&row.kind)?,
            user_id: row.user_id,
            scheme_id: row.scheme_id,
            status: parse(&row.status)?,
            initial_amount: row.initial_amount,
            weight: row.weight,
            initial_date: row.initial_date,
            end_date: row.end_date,
            due_date: row.due_date,
            payments: row.payments.0,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_user_where(&self, column: &str, value: &str) -> AppResult<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE {} = $1", USER_COLUMNS, column);
        sqlx::query_as::<_, UserRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?
            .map(User::try_from)
            .transpose()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_user(&self, user: &User) -> AppResult<()> {
        let sql = format!(
            "INSERT INTO users ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
            USER_COLUMNS
        );
        sqlx::query(&sql)
            .bind(user.id)
            .bind(&user.username)
            .bind(&user.fullname)
            .bind(&user.phone_number)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.referral_code)
            .bind(user.role.as_str())
            .bind(&user.otp)
            .bind(&user.token)
            .bind(user.token_created_at)
            .bind(user.address.as_ref().map(Json))
            .bind(user.bank_details.as_ref().map(Json))
            .bind(&user.aadhaar_number)
            .bind(&user.pan_number)
            .bind(user.kyc.as_ref().map(Json))
            .bind(user.is_verified_kyc)
            .bind(user.created_at)
            .bind(user.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_user(&self, id: Uuid) -> AppResult<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        self.find_user_where("email", email).await
    }

    async fn find_user_by_phone(&self, phone_number: &str) -> AppResult<Option<User>> {
        self.find_user_where("phone_number", phone_number).await
    }

    async fn find_user_by_username(&self, username: &str) -> AppResult<Option<User>> {
        self.find_user_where("username", username).await
    }

    async fn save_user(&self, user: &User) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE users SET username = $2, fullname = $3, phone_number = $4, email = $5, \
             password_hash = $6, referral_code = $7, role = $8, otp = $9, token = $10, \
             token_created_at = $11, address = $12, bank_details = $13, aadhaar_number = $14, \
             pan_number = $15, kyc = $16, is_verified_kyc = $17, updated_at = $18 WHERE id = $1",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.fullname)
        .bind(&user.phone_number)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.referral_code)
        .bind(user.role.as_str())
        .bind(&user.otp)
        .bind(&user.token)
        .bind(user.token_created_at)
        .bind(user.address.as_ref().map(Json))
        .bind(user.bank_details.as_ref().map(Json))
        .bind(&user.aadhaar_number)
        .bind(&user.pan_number)
        .bind(user.kyc.as_ref().map(Json))
        .bind(user.is_verified_kyc)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_user(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_scheme(&self, scheme: &Scheme) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO schemes (id, name, scheme_type, contribution_mode, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(scheme.id)
        .bind(&scheme.name)
        .bind(scheme.scheme_type.as_str())
        .bind(scheme.contribution_mode.map(|m| m.as_str()))
        .bind(scheme.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_scheme(&self, id: Uuid) -> AppResult<Option<Scheme>> {
        sqlx::query_as::<_, SchemeRow>(
            "SELECT id, name, scheme_type, contribution_mode, created_at FROM schemes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Scheme::try_from)
        .transpose()
    }

    async fn list_schemes(&self) -> AppResult<Vec<Scheme>> {
        sqlx::query_as::<_, SchemeRow>(
            "SELECT id, name, scheme_type, contribution_mode, created_at FROM schemes ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Scheme::try_from)
        .collect()
    }

    async fn insert_rate(&self, rate: &Rate) -> AppResult<()> {
        sqlx::query("INSERT INTO rates (id, gold_rate, created_at) VALUES ($1, $2, $3)")
            .bind(rate.id)
            .bind(rate.gold_rate)
            .bind(rate.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_rate(&self) -> AppResult<Option<Rate>> {
        let row = sqlx::query_as::<_, RateRow>(
            "SELECT id, gold_rate, created_at FROM rates ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Rate {
            id: r.id,
            gold_rate: r.gold_rate,
            created_at: r.created_at,
        }))
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> AppResult<()> {
        let sql = format!(
            "INSERT INTO subscriptions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(subscription.id)
            .bind(subscription.kind.as_str())
            .bind(subscription.user_id)
            .bind(subscription.scheme_id)
            .bind(subscription.status.as_str())
            .bind(subscription.initial_amount)
            .bind(subscription.weight)
            .bind(subscription.initial_date)
            .bind(subscription.end_date)
            .bind(subscription.due_date)
            .bind(Json(&subscription.payments))
            .bind(subscription.version)
            .bind(subscription.created_at)
            .bind(subscription.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_subscription(&self, id: Uuid) -> AppResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> AppResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions \
             WHERE ($1::uuid IS NULL OR user_id = $1) \
             AND ($2::text IS NULL OR status = $2) \
             ORDER BY created_at",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(filter.user_id)
            .bind(filter.status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Subscription::try_from)
            .collect()
    }

    async fn append_payment(
        &self,
        subscription_id: Uuid,
        attempt: &PaymentAttempt,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET payments = payments || $2, updated_at = $3 WHERE id = $1",
        )
        .bind(subscription_id)
        .bind(Json([attempt]))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn settle_payment(
        &self,
        subscription_id: Uuid,
        attempt: &PaymentAttempt,
    ) -> AppResult<SettleOutcome> {
        let Some(payment_id) = attempt.payment_id.as_deref() else {
            return Err(AppError::Internal("settlement without payment id".into()));
        };
        let mut tx = self.pool.begin().await?;

        // The primary key serialises concurrent callbacks: a second insert of the
        // same payment id waits for the first transaction and then does nothing.
        let claimed = sqlx::query(
            "INSERT INTO settled_payments (payment_id, subscription_id, settled_at) \
             VALUES ($1, $2, $3) ON CONFLICT (payment_id) DO NOTHING",
        )
        .bind(payment_id)
        .bind(subscription_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            let holder: Option<(Uuid,)> = sqlx::query_as(
                "SELECT subscription_id FROM settled_payments WHERE payment_id = $1",
            )
            .bind(payment_id)
            .fetch_optional(&mut *tx)
            .await?;
            tx.rollback().await?;
            return Ok(match holder {
                Some((id,)) if id == subscription_id => SettleOutcome::AlreadySettled,
                _ => SettleOutcome::ClaimedElsewhere,
            });
        }

        let pending = serde_json::json!([{ "order_id": attempt.order_id, "status": "pending" }]);
        let result = sqlx::query(
            "UPDATE subscriptions SET payments = payments || $2, status = 'active', \
             updated_at = $3, version = version + 1 \
             WHERE id = $1 AND payments @> $4",
        )
        .bind(subscription_id)
        .bind(Json([attempt]))
        .bind(Utc::now())
        .bind(Json(pending))
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(SettleOutcome::UnknownOrder);
        }

        tx.commit().await?;
        Ok(SettleOutcome::Applied)
    }

    async fn apply_status_update(
        &self,
        change: &StatusChange,
        kyc: Option<KycVerification>,
    ) -> AppResult<StatusUpdateOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(k) = kyc {
            let result = sqlx::query(
                "UPDATE users SET is_verified_kyc = $2, updated_at = $3 WHERE id = $1",
            )
            .bind(k.user_id)
            .bind(k.verified)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(StatusUpdateOutcome::UserMissing);
            }
        }

        let result = sqlx::query(
            "UPDATE subscriptions SET status = $3, initial_date = $4, end_date = $5, \
             due_date = $6, updated_at = $7, version = version + 1 \
             WHERE id = $1 AND version = $2",
        )
        .bind(change.subscription_id)
        .bind(change.expected_version)
        .bind(change.status.as_str())
        .bind(change.initial_date)
        .bind(change.end_date)
        .bind(change.due_date)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(StatusUpdateOutcome::NotModified);
        }

        tx.commit().await?;
        Ok(StatusUpdateOutcome::Applied)
    }
}
