// src/users.rs
use crate::auth::Caller;
use crate::error::{AppError, AppResult};
use crate::models::{
    KycDocument, KycDocuments, KycView, UpdateKycRequest, UpdateProfileRequest,
    UpdateUserRequest, User, UserProfile,
};
use crate::store::Store;
use actix_web::{HttpResponse, delete, get, put, web};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(get_user);
    cfg.service(update_user);
    cfg.service(delete_user);
    cfg.service(update_profile);
    cfg.service(update_kyc);
}

pub struct UserService {
    store: Arc<dyn Store>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn filled(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn validate_documents(docs: &[KycDocument], kind: &str) -> AppResult<()> {
    if docs.is_empty() {
        return Err(AppError::invalid(
            "At least one Aadhaar image and one PAN image are required",
        ));
    }
    if docs.len() > 5 {
        return Err(AppError::invalid(format!(
            "At most 5 {} images are accepted",
            kind
        )));
    }
    if docs
        .iter()
        .any(|d| d.content_type.trim().is_empty() || d.data.is_empty())
    {
        return Err(AppError::invalid(format!(
            "Every {} image needs a content type and data",
            kind
        )));
    }
    Ok(())
}

impl UserService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn load(&self, id: Uuid) -> AppResult<User> {
        self.store
            .find_user(id)
            .await?
            .ok_or_else(|| AppError::not_found("User not found"))
    }

    async fn save(&self, user: &mut User) -> AppResult<()> {
        user.updated_at = Utc::now();
        if !self.store.save_user(user).await? {
            return Err(AppError::not_found("User not found"));
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> AppResult<(UserProfile, Option<KycView>)> {
        let user = self.load(id).await?;
        Ok((user.profile(), user.kyc_view()))
    }

    pub async fn update(&self, id: Uuid, req: UpdateUserRequest) -> AppResult<UserProfile> {
        let mut user = self.load(id).await?;
        if let Some(username) = non_empty(req.username) {
            if username != user.username {
                if self.store.find_user_by_username(&username).await?.is_some() {
                    return Err(AppError::Conflict("Username is already taken".into()));
                }
                user.username = username;
            }
        }
        if let Some(fullname) = non_empty(req.fullname) {
            user.fullname = fullname;
        }
        if let Some(email) = non_empty(req.email) {
            let email = email.to_lowercase();
            if email != user.email {
                if self.store.find_user_by_email(&email).await?.is_some() {
                    return Err(AppError::Conflict("Email is already registered".into()));
                }
                user.email = email;
            }
        }
        if let Some(phone_number) = non_empty(req.phone_number) {
            if phone_number != user.phone_number {
                if self.store.find_user_by_phone(&phone_number).await?.is_some() {
                    return Err(AppError::Conflict(
                        "Phone number is already registered".into(),
                    ));
                }
                user.phone_number = phone_number;
            }
        }
        self.save(&mut user).await?;
        Ok(user.profile())
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<()> {
        if !self.store.delete_user(id).await? {
            return Err(AppError::not_found("User not found"));
        }
        tracing::info!("Deleted user {}", id);
        Ok(())
    }

    pub async fn update_profile(
        &self,
        id: Uuid,
        req: UpdateProfileRequest,
    ) -> AppResult<UserProfile> {
        let (Some(address), Some(bank_details)) = (req.address, req.bank_details) else {
            return Err(AppError::invalid("Address and bank details are required"));
        };
        if !(filled(&address.street)
            && filled(&address.city)
            && filled(&address.state)
            && filled(&address.pincode))
        {
            return Err(AppError::invalid("Incomplete address information"));
        }
        if !(filled(&bank_details.account_number)
            && filled(&bank_details.ifsc_code)
            && filled(&bank_details.bank_name))
        {
            return Err(AppError::invalid("Incomplete bank details"));
        }

        let mut user = self.load(id).await?;
        user.address = Some(address);
        user.bank_details = Some(bank_details);
        self.save(&mut user).await?;
        Ok(user.profile())
    }

    /// Stores KYC documents and extracted numbers. Never touches `is_verified_kyc`;
    /// that flag is set only when an administrator approves a subscription.
    pub async fn update_kyc(&self, id: Uuid, req: UpdateKycRequest) -> AppResult<KycView> {
        let (Some(aadhaar_number), Some(pan_number)) =
            (non_empty(req.aadhaar_number), non_empty(req.pan_number))
        else {
            return Err(AppError::invalid(
                "Aadhaar number and PAN number are required",
            ));
        };
        validate_documents(&req.aadhaar_images, "Aadhaar")?;
        validate_documents(&req.pan_images, "PAN")?;

        let mut user = self.load(id).await?;
        user.aadhaar_number = Some(aadhaar_number);
        user.pan_number = Some(pan_number.to_uppercase());
        user.kyc = Some(KycDocuments {
            aadhaar_images: req.aadhaar_images,
            pan_images: req.pan_images,
        });
        self.save(&mut user).await?;
        tracing::info!("KYC documents stored for user {}", user.id);
        user.kyc_view()
            .ok_or_else(|| AppError::Internal("stored KYC is incomplete".into()))
    }
}

#[get("/users/{id}")]
pub async fn get_user(
    users: web::Data<UserService>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    caller.require_self_or_admin(id)?;
    let (profile, kyc) = users.get(id).await?;
    Ok(match kyc {
        Some(kyc) => HttpResponse::Ok().json(json!({
            "user_details": profile,
            "kyc": kyc,
        })),
        None => HttpResponse::Ok().json(json!({
            "user_details": profile,
            "message": "KYC data not available",
        })),
    })
}

#[put("/users/{id}")]
pub async fn update_user(
    users: web::Data<UserService>,
    caller: Caller,
    path: web::Path<Uuid>,
    req: web::Json<UpdateUserRequest>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    caller.require_self_or_admin(id)?;
    let user = users.update(id, req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "User updated successfully",
        "user": user,
    })))
}

#[delete("/users/{id}")]
pub async fn delete_user(
    users: web::Data<UserService>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    caller.require_self_or_admin(id)?;
    users.delete(id).await?;
    Ok(HttpResponse::Ok().json(json!({"message": "User deleted successfully"})))
}

#[put("/users/{id}/profile")]
pub async fn update_profile(
    users: web::Data<UserService>,
    caller: Caller,
    path: web::Path<Uuid>,
    req: web::Json<UpdateProfileRequest>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    caller.require_self_or_admin(id)?;
    let user = users.update_profile(id, req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "Profile updated successfully",
        "user": user,
    })))
}

#[put("/users/{id}/kyc")]
pub async fn update_kyc(
    users: web::Data<UserService>,
    caller: Caller,
    path: web::Path<Uuid>,
    req: web::Json<UpdateKycRequest>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    caller.require_self_or_admin(id)?;
    let kyc = users.update_kyc(id, req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "KYC updated successfully",
        "kyc": {
            "aadhaar_number": kyc.aadhaar_number,
            "pan_number": kyc.pan_number,
            "aadhaar_images": kyc.aadhaar_images.len(),
            "pan_images": kyc.pan_images.len(),
        },
    })))
}
