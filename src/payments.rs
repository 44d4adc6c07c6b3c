// src/payments.rs
use crate::auth::Caller;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{
    CreateOrderRequest, PaymentAttempt, PaymentStatus, SchemeType, Subscription,
    VerifyPaymentRequest,
};
use crate::schemes::SchemeCatalog;
use crate::store::{SettleOutcome, Store};
use actix_web::{HttpResponse, post, web};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(create_gold_order);
    cfg.service(create_diamond_order);
    cfg.service(verify_payment);
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OrderNotes {
    pub subscription_id: Uuid,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OrderRequest {
    /// In the currency's minor unit.
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub notes: OrderNotes,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GatewayOrder {
    pub id: String,
    pub currency: String,
    pub amount: i64,
    #[serde(default)]
    pub receipt: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Recorded as the payment method on every attempt.
    fn name(&self) -> &'static str;
    async fn create_order(&self, order: &OrderRequest) -> AppResult<GatewayOrder>;
}

pub struct RazorpayGateway {
    client: reqwest::Client,
    api_url: String,
    key_id: String,
    key_secret: String,
}

impl RazorpayGateway {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.razorpay_api_url.trim_end_matches('/').to_string(),
            key_id: config.razorpay_key_id.clone(),
            key_secret: config.razorpay_key_secret.clone(),
        }
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn name(&self) -> &'static str {
        "razorpay"
    }

    async fn create_order(&self, order: &OrderRequest) -> AppResult<GatewayOrder> {
        let response = self
            .client
            .post(format!("{}/orders", self.api_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(order)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Payment gateway request failed: {}", e);
                AppError::ExternalService(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::error!("Payment gateway rejected order: {} {}", status, detail);
            return Err(AppError::ExternalService(format!("{}: {}", status, detail)));
        }

        response.json::<GatewayOrder>().await.map_err(|e| {
            tracing::error!("Unreadable payment gateway response: {}", e);
            AppError::ExternalService(e.to_string())
        })
    }
}

/// HMAC-SHA256 over `order_id|payment_id`, keyed with the gateway secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    keyed: HmacSha256,
}

impl SignatureVerifier {
    pub fn new(secret: &str) -> AppResult<Self> {
        if secret.is_empty() {
            return Err(AppError::invalid("payment signing secret is not configured"));
        }
        let keyed = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| AppError::invalid(e.to_string()))?;
        Ok(Self { keyed })
    }

    fn mac(&self, order_id: &str, payment_id: &str) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(order_id.as_bytes());
        mac.update(b"|");
        mac.update(payment_id.as_bytes());
        mac
    }

    /// Hex signature the gateway is expected to send.
    #[cfg(test)]
    pub fn sign(&self, order_id: &str, payment_id: &str) -> String {
        hex::encode(self.mac(order_id, payment_id).finalize().into_bytes())
    }

    /// Constant-time comparison against the hex-encoded `signature`.
    pub fn verify(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        match hex::decode(signature.trim()) {
            Ok(bytes) => self.mac(order_id, payment_id).verify_slice(&bytes).is_ok(),
            Err(_) => false,
        }
    }
}

fn minor_units(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    Settled,
    AlreadySettled,
}

pub struct PaymentService {
    store: Arc<dyn Store>,
    schemes: SchemeCatalog,
    gateway: Arc<dyn PaymentGateway>,
    verifier: SignatureVerifier,
    currency: String,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn Store>,
        schemes: SchemeCatalog,
        gateway: Arc<dyn PaymentGateway>,
        verifier: SignatureVerifier,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            schemes,
            gateway,
            verifier,
            currency: currency.into(),
        }
    }

    async fn owned_subscription(&self, caller: &Caller, id: Uuid) -> AppResult<Subscription> {
        let subscription = self
            .store
            .find_subscription(id)
            .await?
            .ok_or_else(|| AppError::not_found("Subscription not found"))?;
        if !caller.can_act_for(subscription.user_id) {
            return Err(AppError::Forbidden);
        }
        Ok(subscription)
    }

    /// Opens a gateway order and records it as a pending attempt. Status is
    /// left untouched.
    pub async fn create_order(
        &self,
        caller: &Caller,
        kind: SchemeType,
        subscription_id: Uuid,
        amount: f64,
        weight: Option<f64>,
    ) -> AppResult<GatewayOrder> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(AppError::invalid("amount must be a positive number"));
        }
        let subscription = self.owned_subscription(caller, subscription_id).await?;
        if subscription.kind != kind {
            return Err(AppError::not_found(format!(
                "{} subscription not found",
                kind
            )));
        }
        self.schemes.get(subscription.scheme_id).await?;

        let request = OrderRequest {
            amount: minor_units(amount),
            currency: self.currency.clone(),
            receipt: format!("receipt_{}", subscription_id),
            notes: OrderNotes { subscription_id },
        };
        let order = self.gateway.create_order(&request).await?;

        let attempt = PaymentAttempt {
            amount,
            status: PaymentStatus::Pending,
            method: self.gateway.name().to_string(),
            order_id: order.id.clone(),
            payment_id: None,
            signature: None,
            weight: match kind {
                SchemeType::Diamond => weight,
                SchemeType::Gold => None,
            },
            created_at: Utc::now(),
        };
        if !self.store.append_payment(subscription_id, &attempt).await? {
            return Err(AppError::not_found("Subscription not found"));
        }
        tracing::info!(
            "Created {} order {} for subscription {}",
            kind,
            order.id,
            subscription_id
        );
        Ok(order)
    }

    /// Checks the gateway callback signature and, on a match, records the
    /// completed attempt and activates the subscription. The order must be one
    /// opened for this subscription, and a payment id settles at most one
    /// subscription. A payment id already settled here is reported, not
    /// recorded again.
    pub async fn verify_payment(
        &self,
        caller: &Caller,
        subscription_id: Uuid,
        payment_id: &str,
        order_id: &str,
        signature: &str,
    ) -> AppResult<(Settlement, Subscription)> {
        let subscription = self.owned_subscription(caller, subscription_id).await?;
        let scheme = self.schemes.get(subscription.scheme_id).await?;

        if !self.verifier.verify(order_id, payment_id, signature) {
            tracing::warn!(
                "Signature mismatch for subscription {} order {}",
                subscription_id,
                order_id
            );
            return Err(AppError::VerificationFailed);
        }

        if subscription.is_settled_by(payment_id) {
            return Ok((Settlement::AlreadySettled, subscription));
        }

        let attempt = PaymentAttempt {
            amount: subscription.initial_amount,
            status: PaymentStatus::Completed,
            method: self.gateway.name().to_string(),
            order_id: order_id.to_string(),
            payment_id: Some(payment_id.to_string()),
            signature: Some(signature.to_string()),
            weight: None,
            created_at: Utc::now(),
        };
        let settlement = match self.store.settle_payment(subscription_id, &attempt).await? {
            SettleOutcome::Applied => {
                tracing::info!(
                    "Settled {} payment {} for subscription {}",
                    scheme.scheme_type,
                    payment_id,
                    subscription_id
                );
                Settlement::Settled
            }
            // A concurrent callback for the same payment id won.
            SettleOutcome::AlreadySettled => Settlement::AlreadySettled,
            SettleOutcome::ClaimedElsewhere => {
                tracing::warn!(
                    "Payment {} replayed against subscription {}",
                    payment_id,
                    subscription_id
                );
                return Err(AppError::Conflict(
                    "Payment already settled for another subscription".into(),
                ));
            }
            SettleOutcome::UnknownOrder => {
                tracing::warn!(
                    "Order {} has no pending attempt on subscription {}",
                    order_id,
                    subscription_id
                );
                return Err(AppError::invalid(
                    "Order was not created for this subscription",
                ));
            }
        };

        let settled = self
            .store
            .find_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::not_found("Subscription not found"))?;
        Ok((settlement, settled))
    }
}

async fn create_order_for(
    payments: &PaymentService,
    caller: &Caller,
    kind: SchemeType,
    req: CreateOrderRequest,
) -> Result<HttpResponse, AppError> {
    let order = payments
        .create_order(caller, kind, req.subscription_id, req.amount, req.weight)
        .await?;
    let label = match kind {
        SchemeType::Gold => "Gold",
        SchemeType::Diamond => "Diamond",
    };
    Ok(HttpResponse::Ok().json(json!({
        "message": format!("{} Payment order created successfully", label),
        "order_id": order.id,
        "currency": order.currency,
        "amount": order.amount,
        "order_receipt": order.receipt,
    })))
}

#[post("/payments/create-order-gold")]
pub async fn create_gold_order(
    payments: web::Data<PaymentService>,
    caller: Caller,
    req: web::Json<CreateOrderRequest>,
) -> Result<HttpResponse, AppError> {
    create_order_for(&payments, &caller, SchemeType::Gold, req.into_inner()).await
}

#[post("/payments/create-order-diamond")]
pub async fn create_diamond_order(
    payments: web::Data<PaymentService>,
    caller: Caller,
    req: web::Json<CreateOrderRequest>,
) -> Result<HttpResponse, AppError> {
    create_order_for(&payments, &caller, SchemeType::Diamond, req.into_inner()).await
}

#[post("/payments/verify-payment")]
pub async fn verify_payment(
    payments: web::Data<PaymentService>,
    caller: Caller,
    req: web::Json<VerifyPaymentRequest>,
) -> Result<HttpResponse, AppError> {
    let (settlement, subscription) = payments
        .verify_payment(
            &caller,
            req.subscription_id,
            &req.payment_id,
            &req.order_id,
            &req.signature,
        )
        .await?;
    let message = match settlement {
        Settlement::Settled => "Payment verified successfully",
        Settlement::AlreadySettled => "Payment was already verified",
    };
    Ok(HttpResponse::Ok().json(json!({
        "message": message,
        "settlement": settlement,
        "subscription": subscription,
    })))
}
