// src/auth.rs
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{
    Claims, LoginRequest, Role, SignupRequest, User, UserProfile, VerifyOtpRequest,
};
use crate::sms::SmsSender;
use crate::store::Store;
use actix_web::{
    FromRequest, HttpRequest, HttpResponse, dev::Payload, http::header, post, web,
};
use bcrypt::{DEFAULT_COST, hash};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::Rng;
use serde_json::json;
use std::future::{Ready, ready};
use subtle::ConstantTimeEq;
use std::sync::Arc;
use uuid::Uuid;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(signup);
    cfg.service(login);
    cfg.service(verify_otp);
}

/// Issues and checks HS256 session tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: String,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: impl Into<String>, ttl_hours: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl: Duration::hours(ttl_hours),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.jwt_secret.clone(), config.token_ttl_hours)
    }

    pub fn issue(&self, user: &User) -> AppResult<String> {
        let claims = Claims {
            sub: user.id.to_string(),
            role: user.role,
            exp: (Utc::now() + self.ttl).timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_ref()),
        )
        .map_err(|e| {
            tracing::error!("Token generation error: {}", e);
            AppError::Internal(e.to_string())
        })
    }

    pub fn decode(&self, token: &str) -> AppResult<Caller> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_ref()),
            &Validation::default(),
        )
        .map_err(|e| {
            tracing::debug!("Rejected token: {}", e);
            AppError::Unauthorized
        })?;
        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| AppError::Unauthorized)?;
        Ok(Caller {
            user_id,
            role: data.claims.role,
        })
    }
}

/// The authenticated principal behind a request, taken from `Authorization: Bearer`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> AppResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }

    pub fn can_act_for(&self, user_id: Uuid) -> bool {
        self.is_admin() || self.user_id == user_id
    }

    pub fn require_self_or_admin(&self, user_id: Uuid) -> AppResult<()> {
        if self.can_act_for(user_id) {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }

    fn from_http(req: &HttpRequest) -> AppResult<Self> {
        let issuer = req
            .app_data::<web::Data<TokenIssuer>>()
            .ok_or_else(|| AppError::Internal("token issuer not registered".into()))?;
        let token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;
        issuer.decode(token.trim())
    }
}

impl FromRequest for Caller {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(Self::from_http(req))
    }
}

fn generate_otp() -> String {
    rand::thread_rng().gen_range(100_000..1_000_000).to_string()
}

fn generate_referral_code() -> String {
    format!("REF{:03}", rand::thread_rng().gen_range(0..1000))
}

fn otp_matches(stored: Option<&str>, supplied: &str) -> bool {
    stored.is_some_and(|code| bool::from(code.as_bytes().ct_eq(supplied.as_bytes())))
}

fn required(value: &str, name: &str) -> AppResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::invalid(format!("{} is required", name)));
    }
    Ok(value.to_string())
}

/// Signup and phone-OTP login.
pub struct AuthService {
    store: Arc<dyn Store>,
    sms: Arc<dyn SmsSender>,
    tokens: TokenIssuer,
    country_code: String,
    hash_cost: u32,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn Store>,
        sms: Arc<dyn SmsSender>,
        tokens: TokenIssuer,
        country_code: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sms,
            tokens,
            country_code: country_code.into(),
            hash_cost: DEFAULT_COST,
        }
    }

    #[cfg(test)]
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    pub async fn signup(&self, req: SignupRequest) -> AppResult<UserProfile> {
        let username = required(&req.username, "username")?;
        let fullname = required(&req.fullname, "fullname")?;
        let phone_number = required(&req.phone_number, "phone_number")?;
        let email = required(&req.email, "email")?.to_lowercase();
        if !email.contains('@') {
            return Err(AppError::invalid("email is malformed"));
        }
        if req.password.is_empty() {
            return Err(AppError::invalid("password is required"));
        }

        if self.store.find_user_by_email(&email).await?.is_some()
            || self.store.find_user_by_phone(&phone_number).await?.is_some()
            || self.store.find_user_by_username(&username).await?.is_some()
        {
            return Err(AppError::Conflict("User already exists".into()));
        }

        let password_hash = hash(&req.password, self.hash_cost).map_err(|e| {
            tracing::error!("Password hashing error: {}", e);
            AppError::Internal(e.to_string())
        })?;

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username,
            fullname,
            phone_number,
            email,
            password_hash,
            referral_code: Some(generate_referral_code()),
            role: Role::User,
            otp: None,
            token: None,
            token_created_at: None,
            address: None,
            bank_details: None,
            aadhaar_number: None,
            pan_number: None,
            kyc: None,
            is_verified_kyc: false,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_user(&user).await?;
        tracing::info!("Created user {}", user.id);
        Ok(user.profile())
    }

    fn international(&self, phone_number: &str) -> String {
        if phone_number.starts_with('+') {
            phone_number.to_string()
        } else {
            format!("{}{}", self.country_code, phone_number)
        }
    }

    /// Sends a fresh OTP to the account's phone. The code itself never leaves
    /// this function except through the SMS transport.
    pub async fn request_otp(&self, phone_number: Option<&str>) -> AppResult<()> {
        let phone_number = phone_number
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AppError::invalid("Phone number is required"))?;

        let mut user = self
            .store
            .find_user_by_phone(phone_number)
            .await?
            .ok_or_else(|| AppError::not_found("Account not found"))?;

        let otp = generate_otp();
        let message_id = self
            .sms
            .send(
                &self.international(phone_number),
                &format!("Your OTP is {}", otp),
            )
            .await?;

        user.otp = Some(otp);
        user.updated_at = Utc::now();
        self.store.save_user(&user).await?;
        tracing::info!("OTP sent to user {} (message {})", user.id, message_id);
        Ok(())
    }

    pub async fn verify_otp(
        &self,
        phone_number: Option<&str>,
        otp: Option<&str>,
    ) -> AppResult<(String, UserProfile)> {
        let (Some(phone_number), Some(otp)) = (
            phone_number.map(str::trim).filter(|p| !p.is_empty()),
            otp.map(str::trim).filter(|o| !o.is_empty()),
        ) else {
            return Err(AppError::invalid("Phone number and OTP are required"));
        };

        let mut user = self
            .store
            .find_user_by_phone(phone_number)
            .await?
            .ok_or_else(|| AppError::not_found("User not found"))?;

        if !otp_matches(user.otp.as_deref(), otp) {
            tracing::warn!("Invalid OTP for user {}", user.id);
            return Err(AppError::Unauthorized);
        }

        let token = self.tokens.issue(&user)?;
        let now = Utc::now();
        user.otp = None;
        user.token = Some(token.clone());
        user.token_created_at = Some(now);
        user.updated_at = now;
        self.store.save_user(&user).await?;
        tracing::info!("User {} logged in", user.id);
        Ok((token, user.profile()))
    }
}

#[post("/auth/signup")]
pub async fn signup(
    auth: web::Data<AuthService>,
    req: web::Json<SignupRequest>,
) -> Result<HttpResponse, AppError> {
    let user = auth.signup(req.into_inner()).await?;
    Ok(HttpResponse::Created().json(json!({
        "message": "User created successfully",
        "user": user,
    })))
}

#[post("/auth/login")]
pub async fn login(
    auth: web::Data<AuthService>,
    req: web::Json<LoginRequest>,
) -> Result<HttpResponse, AppError> {
    auth.request_otp(req.phone_number.as_deref()).await?;
    Ok(HttpResponse::Ok().json(json!({"message": "OTP sent successfully"})))
}

#[post("/auth/verify-otp")]
pub async fn verify_otp(
    auth: web::Data<AuthService>,
    req: web::Json<VerifyOtpRequest>,
) -> Result<HttpResponse, AppError> {
    let (token, user) = auth
        .verify_otp(req.phone_number.as_deref(), req.otp.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "OTP verified successfully",
        "token": token,
        "user": user,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sms::testing::RecordingSender;
    use crate::store::memory::MemoryStore;
    use actix_web::{App, test as actix_test};

    struct Harness {
        store: Arc<MemoryStore>,
        sms: Arc<RecordingSender>,
        auth: AuthService,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let sms = Arc::new(RecordingSender::default());
        let auth = AuthService::new(
            store.clone(),
            sms.clone(),
            TokenIssuer::new("jwt-test-secret", 168),
            "+91",
        )
        .with_hash_cost(4);
        Harness { store, sms, auth }
    }

    fn signup_request(phone: &str, email: &str) -> SignupRequest {
        SignupRequest {
            username: format!("ravi{}", phone),
            fullname: "Ravi Kumar".into(),
            phone_number: phone.into(),
            email: email.into(),
            password: "hunter22".into(),
        }
    }

    #[tokio::test]
    async fn signup_hashes_password_and_assigns_referral() {
        let h = harness();
        let profile = h
            .auth
            .signup(signup_request("9000000001", "Ravi@Example.com"))
            .await
            .unwrap();
        assert_eq!(profile.role, Role::User);
        assert_eq!(profile.email, "ravi@example.com");
        let code = profile.referral_code.unwrap();
        assert!(code.starts_with("REF") && code.len() == 6);

        let stored = h.store.user(profile.id).unwrap();
        assert_ne!(stored.password_hash, "hunter22");
        assert!(bcrypt::verify("hunter22", &stored.password_hash).unwrap());
    }

    #[tokio::test]
    async fn duplicate_email_or_phone_conflicts() {
        let h = harness();
        h.auth
            .signup(signup_request("9000000001", "a@example.com"))
            .await
            .unwrap();
        let by_email = h
            .auth
            .signup(signup_request("9000000002", "a@example.com"))
            .await;
        assert!(matches!(by_email, Err(AppError::Conflict(_))));
        let by_phone = h
            .auth
            .signup(signup_request("9000000001", "b@example.com"))
            .await;
        assert!(matches!(by_phone, Err(AppError::Conflict(_))));
    }

    #[test]
    fn otp_comparison_requires_exact_code() {
        assert!(otp_matches(Some("123456"), "123456"));
        assert!(!otp_matches(Some("123456"), "123457"));
        assert!(!otp_matches(Some("123456"), "12345"));
        assert!(!otp_matches(None, "123456"));
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let h = harness();
        h.auth
            .signup(signup_request("9000000001", "a@example.com"))
            .await
            .unwrap();
        let taken = SignupRequest {
            username: "ravi9000000001".into(),
            ..signup_request("9000000002", "b@example.com")
        };
        let err = h.auth.signup(taken).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn simultaneous_signups_yield_one_conflict() {
        let h = harness();
        let (first, second) = tokio::join!(
            h.auth.signup(signup_request("9000000001", "a@example.com")),
            h.auth.signup(signup_request("9000000001", "a@example.com")),
        );
        let conflicts = [&first, &second]
            .into_iter()
            .filter(|r| matches!(r, Err(AppError::Conflict(_))))
            .count();
        assert_eq!(conflicts, 1);
        assert!(first.is_ok() || second.is_ok());
    }

    #[tokio::test]
    async fn otp_round_trip_issues_token_and_clears_code() {
        let h = harness();
        let profile = h
            .auth
            .signup(signup_request("9000000001", "a@example.com"))
            .await
            .unwrap();

        h.auth.request_otp(Some(" 9000000001 ")).await.unwrap();
        let (to, body) = h.sms.last().unwrap();
        assert_eq!(to, "+919000000001");
        let otp = body.trim_start_matches("Your OTP is ").to_string();
        assert_eq!(otp.len(), 6);
        assert_eq!(h.store.user(profile.id).unwrap().otp, Some(otp.clone()));

        let (token, user) = h
            .auth
            .verify_otp(Some("9000000001"), Some(&otp))
            .await
            .unwrap();
        assert_eq!(user.id, profile.id);
        let caller = h.auth.tokens.decode(&token).unwrap();
        assert_eq!(caller.user_id, profile.id);
        assert_eq!(caller.role, Role::User);

        let stored = h.store.user(profile.id).unwrap();
        assert!(stored.otp.is_none());
        assert_eq!(stored.token.as_deref(), Some(token.as_str()));

        // The code is single use.
        let replay = h.auth.verify_otp(Some("9000000001"), Some(&otp)).await;
        assert!(matches!(replay, Err(AppError::Unauthorized)));
    }

    #[tokio::test]
    async fn wrong_otp_is_unauthorized() {
        let h = harness();
        h.auth
            .signup(signup_request("+449000000001", "a@example.com"))
            .await
            .unwrap();
        h.auth.request_otp(Some("+449000000001")).await.unwrap();
        assert_eq!(h.sms.last().unwrap().0, "+449000000001");
        let err = h
            .auth
            .verify_otp(Some("+449000000001"), Some("000000x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    #[tokio::test]
    async fn otp_requests_validate_input() {
        let h = harness();
        assert!(matches!(
            h.auth.request_otp(None).await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            h.auth.request_otp(Some("9999999999")).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            h.auth.verify_otp(Some("9999999999"), None).await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn failed_sms_does_not_store_otp() {
        let store = Arc::new(MemoryStore::new());
        let auth = AuthService::new(
            store.clone(),
            Arc::new(RecordingSender::failing()),
            TokenIssuer::new("s", 1),
            "+91",
        )
        .with_hash_cost(4);
        let profile = auth
            .signup(signup_request("9000000001", "a@example.com"))
            .await
            .unwrap();
        let err = auth.request_otp(Some("9000000001")).await.unwrap_err();
        assert!(matches!(err, AppError::ExternalService(_)));
        assert!(store.user(profile.id).unwrap().otp.is_none());
    }

    #[test]
    fn caller_permissions() {
        let me = Uuid::new_v4();
        let user = Caller {
            user_id: me,
            role: Role::User,
        };
        assert!(user.require_self_or_admin(me).is_ok());
        assert!(matches!(
            user.require_self_or_admin(Uuid::new_v4()),
            Err(AppError::Forbidden)
        ));
        assert!(user.require_admin().is_err());

        let admin = Caller {
            user_id: Uuid::new_v4(),
            role: Role::Admin,
        };
        assert!(admin.require_self_or_admin(me).is_ok());
        assert!(admin.require_admin().is_ok());
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let mut user = crate::models::fixtures::user();
        user.role = Role::Admin;
        let token = TokenIssuer::new("one", 1).issue(&user).unwrap();
        assert!(matches!(
            TokenIssuer::new("two", 1).decode(&token),
            Err(AppError::Unauthorized)
        ));
        assert_eq!(
            TokenIssuer::new("one", 1).decode(&token).unwrap().role,
            Role::Admin
        );
    }

    #[actix_web::test]
    async fn login_response_never_echoes_the_otp() {
        let h = harness();
        h.auth
            .signup(signup_request("9000000001", "a@example.com"))
            .await
            .unwrap();
        let sms = h.sms.clone();
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(h.auth))
                .configure(init_routes),
        )
        .await;
        let req = actix_test::TestRequest::post()
            .uri("/auth/login")
            .set_json(json!({"phonenumber": "9000000001"}))
            .to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        let otp = sms
            .last()
            .unwrap()
            .1
            .trim_start_matches("Your OTP is ")
            .to_string();
        assert_eq!(body["message"], "OTP sent successfully");
        assert!(!body.to_string().contains(&otp));
    }

    #[actix_web::test]
    async fn requests_without_bearer_token_are_unauthorized() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(TokenIssuer::new("s", 1)))
                .app_data(web::Data::new(crate::rates::RateProvider::new(Arc::new(
                    MemoryStore::new(),
                ))))
                .configure(crate::rates::init_routes),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/rates/latest").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::UNAUTHORIZED);
    }
}
