// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored as TEXT.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {} value: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

text_enum!(Role { User => "user", Admin => "admin" });

/// Commodity of a scheme, and therefore the variant of every subscription made on it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SchemeType {
    Gold,
    Diamond,
}

text_enum!(SchemeType { Gold => "gold", Diamond => "diamond" });

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContributionMode {
    Amount,
    Weight,
}

text_enum!(ContributionMode { Amount => "amount", Weight => "weight" });

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Waiting,
    Active,
    Closed,
    Cancelled,
}

text_enum!(SubscriptionStatus {
    Waiting => "waiting",
    Active => "active",
    Closed => "closed",
    Cancelled => "cancelled",
});

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Address {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub pincode: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct BankDetails {
    pub account_number: Option<String>,
    pub ifsc_code: Option<String>,
    pub bank_name: Option<String>,
}

/// One uploaded document image; `data` is the base64 payload as received.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KycDocument {
    pub content_type: String,
    pub data: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct KycDocuments {
    pub aadhaar_images: Vec<KycDocument>,
    pub pan_images: Vec<KycDocument>,
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub fullname: String,
    pub phone_number: String,
    pub email: String,
    pub password_hash: String,
    pub referral_code: Option<String>,
    pub role: Role,
    pub otp: Option<String>,
    pub token: Option<String>,
    pub token_created_at: Option<DateTime<Utc>>,
    pub address: Option<Address>,
    pub bank_details: Option<BankDetails>,
    pub aadhaar_number: Option<String>,
    pub pan_number: Option<String>,
    pub kyc: Option<KycDocuments>,
    /// Administrator attestation. Never implied by document presence.
    pub is_verified_kyc: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl User {
    /// Both document sets were uploaded.
    pub fn has_kyc_documents(&self) -> bool {
        self.kyc
            .as_ref()
            .is_some_and(|k| !k.aadhaar_images.is_empty() && !k.pan_images.is_empty())
    }

    /// Documents and both extracted id numbers are present. This is what gates
    /// subscription creation; `is_verified_kyc` is not consulted.
    pub fn kyc_complete(&self) -> bool {
        self.has_kyc_documents() && present(&self.aadhaar_number) && present(&self.pan_number)
    }

    pub fn profile(&self) -> UserProfile {
        let is_address_added = self.address.as_ref().is_some_and(|a| {
            present(&a.street) || present(&a.city) || present(&a.state) || present(&a.pincode)
        });
        UserProfile {
            id: self.id,
            username: self.username.clone(),
            fullname: self.fullname.clone(),
            phone_number: self.phone_number.clone(),
            email: self.email.clone(),
            role: self.role,
            referral_code: self.referral_code.clone(),
            address: self.address.clone(),
            bank_details: self.bank_details.clone(),
            aadhaar_number: self.aadhaar_number.clone(),
            pan_number: self.pan_number.clone(),
            is_verified_kyc: self.is_verified_kyc,
            is_address_added,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn kyc_view(&self) -> Option<KycView> {
        if !self.has_kyc_documents() {
            return None;
        }
        let docs = self.kyc.clone().unwrap_or_default();
        Some(KycView {
            aadhaar_number: self.aadhaar_number.clone(),
            pan_number: self.pan_number.clone(),
            aadhaar_images: docs.aadhaar_images,
            pan_images: docs.pan_images,
        })
    }
}

/// What a user record looks like to clients: no credentials, OTP, token or KYC payloads.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub fullname: String,
    pub phone_number: String,
    pub email: String,
    pub role: Role,
    pub referral_code: Option<String>,
    pub address: Option<Address>,
    pub bank_details: Option<BankDetails>,
    pub aadhaar_number: Option<String>,
    pub pan_number: Option<String>,
    pub is_verified_kyc: bool,
    pub is_address_added: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KycView {
    pub aadhaar_number: Option<String>,
    pub pan_number: Option<String>,
    pub aadhaar_images: Vec<KycDocument>,
    pub pan_images: Vec<KycDocument>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Scheme {
    pub id: Uuid,
    pub name: String,
    pub scheme_type: SchemeType,
    /// Only meaningful for gold schemes.
    pub contribution_mode: Option<ContributionMode>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Rate {
    pub id: Uuid,
    pub gold_rate: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PaymentAttempt {
    pub amount: f64,
    pub status: PaymentStatus,
    pub method: String,
    pub order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Subscription {
    pub id: Uuid,
    pub kind: SchemeType,
    pub user_id: Uuid,
    pub scheme_id: Uuid,
    pub status: SubscriptionStatus,
    /// Fixed at creation, never rewritten.
    pub initial_amount: f64,
    pub weight: Option<f64>,
    pub initial_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub payments: Vec<PaymentAttempt>,
    #[serde(skip)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn has_pending_order(&self, order_id: &str) -> bool {
        self.payments
            .iter()
            .any(|p| p.status == PaymentStatus::Pending && p.order_id == order_id)
    }

    pub fn is_settled_by(&self, payment_id: &str) -> bool {
        self.payments.iter().any(|p| {
            p.status == PaymentStatus::Completed && p.payment_id.as_deref() == Some(payment_id)
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Claims {
    pub sub: String, // user_id
    pub role: Role,
    pub exp: usize,
}

#[derive(Serialize, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub fullname: String,
    #[serde(alias = "phonenumber")]
    pub phone_number: String,
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(alias = "phonenumber")]
    pub phone_number: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct VerifyOtpRequest {
    #[serde(alias = "phonenumber")]
    pub phone_number: Option<String>,
    pub otp: Option<String>,
}

#[derive(Serialize, Deserialize, Default)]
pub struct UpdateUserRequest {
    pub username: Option<String>,
    pub fullname: Option<String>,
    pub email: Option<String>,
    #[serde(alias = "phonenumber")]
    pub phone_number: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct UpdateProfileRequest {
    pub address: Option<Address>,
    pub bank_details: Option<BankDetails>,
}

#[derive(Serialize, Deserialize, Default)]
pub struct UpdateKycRequest {
    pub aadhaar_number: Option<String>,
    pub pan_number: Option<String>,
    #[serde(default)]
    pub aadhaar_images: Vec<KycDocument>,
    #[serde(default)]
    pub pan_images: Vec<KycDocument>,
}

#[derive(Serialize, Deserialize)]
pub struct NewSchemeRequest {
    pub name: String,
    pub scheme_type: SchemeType,
    #[serde(alias = "is_weight_or_amount")]
    pub contribution_mode: Option<ContributionMode>,
}

#[derive(Serialize, Deserialize)]
pub struct NewRateRequest {
    pub gold_rate: f64,
}

#[derive(Serialize, Deserialize)]
pub struct CreateGoldSubscriptionRequest {
    pub user_id: Uuid,
    pub scheme_id: Uuid,
    pub amount: Option<f64>,
    pub weight: Option<f64>,
}

#[derive(Serialize, Deserialize)]
pub struct CreateDiamondSubscriptionRequest {
    pub user_id: Uuid,
    pub scheme_id: Uuid,
    pub initial_amount: Option<f64>,
}

#[derive(Serialize, Deserialize)]
pub struct UpdateSubscriptionRequest {
    #[serde(alias = "subscribe_status")]
    pub status: SubscriptionStatus,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(alias = "isVerifiedKyc")]
    pub is_verified_kyc: Option<bool>,
}

#[derive(Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub subscription_id: Uuid,
    pub amount: f64,
    pub weight: Option<f64>,
}

#[derive(Serialize, Deserialize)]
pub struct VerifyPaymentRequest {
    pub subscription_id: Uuid,
    pub payment_id: String,
    pub order_id: String,
    pub signature: String,
}
