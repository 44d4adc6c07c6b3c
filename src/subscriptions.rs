// src/subscriptions.rs
use crate::auth::Caller;
use crate::config::TermPolicy;
use crate::error::{AppError, AppResult};
use crate::models::{
    ContributionMode, CreateDiamondSubscriptionRequest, CreateGoldSubscriptionRequest, KycView,
    Scheme, SchemeType, Subscription, SubscriptionStatus, UpdateSubscriptionRequest,
    UserProfile,
};
use crate::rates::{RateProvider, amount_for_weight};
use crate::schemes::SchemeCatalog;
use crate::store::{
    KycVerification, StatusChange, StatusUpdateOutcome, Store, SubscriptionFilter,
};
use actix_web::{HttpResponse, get, post, put, web};
use chrono::{DateTime, Months, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Fixed subscription term, in calendar months.
pub const TERM_MONTHS: u32 = 11;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    // Literal paths first: `/subscriptions/report/{user_id}` and
    // `/subscriptions/{kind}/{id}` share a shape.
    cfg.service(subscription_report);
    cfg.service(user_subscription_report);
    cfg.service(pending_requests);
    cfg.service(create_gold_subscription);
    cfg.service(create_diamond_subscription);
    cfg.service(update_subscription);
}

/// Caller-supplied contribution. Which field is read depends on the scheme.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContributionInput {
    pub amount: Option<f64>,
    pub weight: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportScope {
    All,
    User(Uuid),
}

#[derive(Serialize, Debug)]
pub struct ReportEntry {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub scheme_details: Option<Scheme>,
}

#[derive(Serialize, Debug, Default)]
pub struct SubscriptionReport {
    pub gold: Vec<ReportEntry>,
    pub diamond: Vec<ReportEntry>,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
pub enum UserDetails {
    Found(UserProfile),
    Unavailable {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Serialize, Debug)]
pub struct PendingRequest {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub user_details: UserDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kyc: Option<KycView>,
}

#[derive(Serialize, Debug)]
pub struct StatusUpdate {
    pub subscription: Subscription,
    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_verified_kyc: Option<bool>,
}

/// Start and end of a term beginning at `start`.
pub fn term_from(start: DateTime<Utc>) -> AppResult<(DateTime<Utc>, DateTime<Utc>)> {
    start
        .checked_add_months(Months::new(TERM_MONTHS))
        .map(|end| (start, end))
        .ok_or_else(|| AppError::Internal(format!("term end out of range for {}", start)))
}

fn positive(value: Option<f64>, message: &str) -> AppResult<f64> {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => Ok(v),
        _ => Err(AppError::invalid(message)),
    }
}

fn capitalized(kind: SchemeType) -> &'static str {
    match kind {
        SchemeType::Gold => "Gold",
        SchemeType::Diamond => "Diamond",
    }
}

/// Creation, administrative status changes and reporting for gold and diamond
/// subscriptions.
pub struct SubscriptionService {
    store: Arc<dyn Store>,
    schemes: SchemeCatalog,
    rates: RateProvider,
    term_policy: TermPolicy,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn Store>,
        schemes: SchemeCatalog,
        rates: RateProvider,
        term_policy: TermPolicy,
    ) -> Self {
        Self {
            store,
            schemes,
            rates,
            term_policy,
        }
    }

    pub async fn create(
        &self,
        kind: SchemeType,
        user_id: Uuid,
        scheme_id: Uuid,
        input: ContributionInput,
    ) -> AppResult<Subscription> {
        let user = self
            .store
            .find_user(user_id)
            .await?
            .ok_or_else(|| AppError::not_found("User not found"))?;
        if !user.kyc_complete() {
            return Err(AppError::PreconditionFailed(
                "User KYC not completed".into(),
            ));
        }

        let scheme = self.schemes.get(scheme_id).await?;
        if scheme.scheme_type != kind {
            return Err(AppError::invalid(format!(
                "This is not a {} subscription scheme",
                capitalized(kind)
            )));
        }

        let (initial_amount, weight) = match kind {
            SchemeType::Gold => match scheme.contribution_mode {
                Some(ContributionMode::Amount) => {
                    let amount = positive(
                        input.amount,
                        "Amount is required for this Gold subscription scheme",
                    )?;
                    (amount, None)
                }
                Some(ContributionMode::Weight) => {
                    let weight = positive(
                        input.weight,
                        "Weight is required for this Gold subscription scheme",
                    )?;
                    let rate = self.rates.latest().await?;
                    (amount_for_weight(weight, &rate), Some(weight))
                }
                None => {
                    return Err(AppError::invalid(
                        "Gold scheme has no contribution mode",
                    ));
                }
            },
            SchemeType::Diamond => {
                let amount = positive(
                    input.amount,
                    "Amount is required for Diamond subscription",
                )?;
                (amount, None)
            }
        };

        let now = Utc::now();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            kind,
            user_id,
            scheme_id,
            status: SubscriptionStatus::Waiting,
            initial_amount,
            weight,
            initial_date: None,
            end_date: None,
            due_date: None,
            payments: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_subscription(&subscription).await?;
        tracing::info!(
            "Created {} subscription {} for user {} (initial amount {})",
            kind,
            subscription.id,
            user_id,
            initial_amount
        );
        Ok(subscription)
    }

    async fn find_kind(&self, kind: SchemeType, id: Uuid) -> AppResult<Subscription> {
        self.store
            .find_subscription(id)
            .await?
            .filter(|s| s.kind == kind)
            .ok_or_else(|| {
                AppError::not_found(format!("{} subscription not found", capitalized(kind)))
            })
    }

    /// Administrative status change. Stamps the term per the configured policy.
    pub async fn update_status(
        &self,
        kind: SchemeType,
        id: Uuid,
        status: SubscriptionStatus,
        due_date: Option<DateTime<Utc>>,
    ) -> AppResult<StatusUpdate> {
        self.apply(kind, id, status, due_date, None).await
    }

    /// Status change and the user's KYC attestation, committed together.
    pub async fn approve_and_verify_kyc(
        &self,
        kind: SchemeType,
        id: Uuid,
        status: SubscriptionStatus,
        due_date: Option<DateTime<Utc>>,
        verified: bool,
    ) -> AppResult<StatusUpdate> {
        self.apply(kind, id, status, due_date, Some(verified)).await
    }

    async fn apply(
        &self,
        kind: SchemeType,
        id: Uuid,
        status: SubscriptionStatus,
        due_date: Option<DateTime<Utc>>,
        verified_kyc: Option<bool>,
    ) -> AppResult<StatusUpdate> {
        let subscription = self.find_kind(kind, id).await?;
        let user_missing =
            || AppError::not_found("User associated with this subscription not found");

        let kyc = match verified_kyc {
            Some(verified) => {
                self.store
                    .find_user(subscription.user_id)
                    .await?
                    .ok_or_else(user_missing)?;
                Some(KycVerification {
                    user_id: subscription.user_id,
                    verified,
                })
            }
            None => None,
        };

        let (initial_date, end_date) = match (
            self.term_policy,
            subscription.initial_date,
            subscription.end_date,
        ) {
            (TermPolicy::FixedFromFirstActivation, Some(start), Some(end)) => (start, end),
            _ => term_from(Utc::now())?,
        };

        let change = StatusChange {
            subscription_id: id,
            expected_version: subscription.version,
            status,
            initial_date,
            end_date,
            due_date,
        };
        match self.store.apply_status_update(&change, kyc).await? {
            StatusUpdateOutcome::Applied => {}
            StatusUpdateOutcome::NotModified => {
                tracing::warn!("Status update for subscription {} modified nothing", id);
                return Err(AppError::Conflict(format!(
                    "Failed to update {} subscription",
                    capitalized(kind)
                )));
            }
            StatusUpdateOutcome::UserMissing => return Err(user_missing()),
        }

        let updated = self.find_kind(kind, id).await?;
        tracing::info!(
            "Subscription {} moved from {} to {}",
            id,
            subscription.status,
            updated.status
        );
        Ok(StatusUpdate {
            user_id: updated.user_id,
            subscription: updated,
            is_verified_kyc: verified_kyc,
        })
    }

    /// Subscriptions joined with their scheme. A scheme that cannot be resolved
    /// yields `scheme_details: null` for that entry only.
    pub async fn report(&self, scope: ReportScope) -> AppResult<SubscriptionReport> {
        let filter = SubscriptionFilter {
            user_id: match scope {
                ReportScope::All => None,
                ReportScope::User(id) => Some(id),
            },
            ..SubscriptionFilter::default()
        };
        let subscriptions = self.store.list_subscriptions(&filter).await?;

        let mut report = SubscriptionReport::default();
        for subscription in subscriptions {
            let scheme_details = match self.schemes.find(subscription.scheme_id).await {
                Ok(scheme) => scheme,
                Err(e) => {
                    tracing::warn!(
                        "Scheme lookup failed for subscription {}: {}",
                        subscription.id,
                        e
                    );
                    None
                }
            };
            let entry = ReportEntry {
                subscription,
                scheme_details,
            };
            match entry.subscription.kind {
                SchemeType::Gold => report.gold.push(entry),
                SchemeType::Diamond => report.diamond.push(entry),
            }
        }
        Ok(report)
    }

    /// Every `waiting` subscription with its owner's profile. A failed owner
    /// lookup turns into an annotation on that entry, never a failed listing.
    pub async fn pending(&self) -> AppResult<Vec<PendingRequest>> {
        let waiting = self
            .store
            .list_subscriptions(&SubscriptionFilter {
                status: Some(SubscriptionStatus::Waiting),
                ..SubscriptionFilter::default()
            })
            .await?;
        if waiting.is_empty() {
            return Err(AppError::not_found("No pending requests found"));
        }

        let mut requests = Vec::with_capacity(waiting.len());
        for subscription in waiting {
            let request = match self.store.find_user(subscription.user_id).await {
                Ok(Some(user)) => PendingRequest {
                    subscription,
                    user_details: UserDetails::Found(user.profile()),
                    kyc: user.kyc_view(),
                },
                Ok(None) => PendingRequest {
                    subscription,
                    user_details: UserDetails::Unavailable {
                        message: "User not found".into(),
                        error: None,
                    },
                    kyc: None,
                },
                Err(e) => {
                    tracing::warn!(
                        "User lookup failed for pending subscription {}: {}",
                        subscription.id,
                        e
                    );
                    PendingRequest {
                        subscription,
                        user_details: UserDetails::Unavailable {
                            message: "Error retrieving user details".into(),
                            error: Some(e.to_string()),
                        },
                        kyc: None,
                    }
                }
            };
            requests.push(request);
        }
        Ok(requests)
    }
}

#[post("/subscriptions/gold")]
pub async fn create_gold_subscription(
    subscriptions: web::Data<SubscriptionService>,
    caller: Caller,
    req: web::Json<CreateGoldSubscriptionRequest>,
) -> Result<HttpResponse, AppError> {
    caller.require_self_or_admin(req.user_id)?;
    let input = ContributionInput {
        amount: req.amount,
        weight: req.weight,
    };
    let subscription = subscriptions
        .create(SchemeType::Gold, req.user_id, req.scheme_id, input)
        .await?;
    Ok(HttpResponse::Created().json(json!({
        "message": "Gold subscription created successfully",
        "subscription": subscription,
    })))
}

#[post("/subscriptions/diamond")]
pub async fn create_diamond_subscription(
    subscriptions: web::Data<SubscriptionService>,
    caller: Caller,
    req: web::Json<CreateDiamondSubscriptionRequest>,
) -> Result<HttpResponse, AppError> {
    caller.require_self_or_admin(req.user_id)?;
    let input = ContributionInput {
        amount: req.initial_amount,
        weight: None,
    };
    let subscription = subscriptions
        .create(SchemeType::Diamond, req.user_id, req.scheme_id, input)
        .await?;
    Ok(HttpResponse::Created().json(json!({
        "message": "Diamond subscription created successfully",
        "subscription": subscription,
    })))
}

#[put("/subscriptions/{kind}/{id}")]
pub async fn update_subscription(
    subscriptions: web::Data<SubscriptionService>,
    caller: Caller,
    path: web::Path<(SchemeType, Uuid)>,
    req: web::Json<UpdateSubscriptionRequest>,
) -> Result<HttpResponse, AppError> {
    caller.require_admin()?;
    let (kind, id) = path.into_inner();
    let req = req.into_inner();
    let update = match req.is_verified_kyc {
        Some(verified) => {
            subscriptions
                .approve_and_verify_kyc(kind, id, req.status, req.due_date, verified)
                .await?
        }
        None => {
            subscriptions
                .update_status(kind, id, req.status, req.due_date)
                .await?
        }
    };
    Ok(HttpResponse::Ok().json(json!({
        "message": format!("{} subscription updated successfully", capitalized(kind)),
        "subscription": update.subscription,
        "user": {
            "id": update.user_id,
            "is_verified_kyc": update.is_verified_kyc,
        },
    })))
}

#[get("/subscriptions/report")]
pub async fn subscription_report(
    subscriptions: web::Data<SubscriptionService>,
    caller: Caller,
) -> Result<HttpResponse, AppError> {
    caller.require_admin()?;
    let report = subscriptions.report(ReportScope::All).await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "Subscription report retrieved successfully",
        "data": report,
    })))
}

#[get("/subscriptions/report/{user_id}")]
pub async fn user_subscription_report(
    subscriptions: web::Data<SubscriptionService>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    caller.require_self_or_admin(user_id)?;
    let report = subscriptions.report(ReportScope::User(user_id)).await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "Subscription report retrieved successfully",
        "data": report,
    })))
}

#[get("/subscriptions/pending")]
pub async fn pending_requests(
    subscriptions: web::Data<SubscriptionService>,
    caller: Caller,
) -> Result<HttpResponse, AppError> {
    caller.require_admin()?;
    let requests = subscriptions.pending().await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "Pending requests retrieved successfully",
        "data": requests,
    })))
}
