// src/schemes.rs
use crate::auth::Caller;
use crate::error::{AppError, AppResult};
use crate::models::{NewSchemeRequest, Scheme, SchemeType};
use crate::store::Store;
use actix_web::{HttpResponse, get, post, web};
use chrono::Utc;
use moka::future::Cache;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(list_schemes);
    cfg.service(create_scheme);
}

/// Scheme entries never change after creation, so lookups are served from an
/// in-process cache once seen.
#[derive(Clone)]
pub struct SchemeCatalog {
    store: Arc<dyn Store>,
    cache: Cache<Uuid, Scheme>,
}

impl SchemeCatalog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: Cache::new(1000),
        }
    }

    pub async fn find(&self, id: Uuid) -> AppResult<Option<Scheme>> {
        if let Some(scheme) = self.cache.get(&id).await {
            return Ok(Some(scheme));
        }
        let scheme = self.store.find_scheme(id).await?;
        if let Some(s) = &scheme {
            self.cache.insert(id, s.clone()).await;
        }
        Ok(scheme)
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Scheme> {
        self.find(id)
            .await?
            .ok_or_else(|| AppError::not_found("Scheme not found"))
    }

    pub async fn list(&self) -> AppResult<Vec<Scheme>> {
        self.store.list_schemes().await
    }

    pub async fn create(&self, req: NewSchemeRequest) -> AppResult<Scheme> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(AppError::invalid("Scheme name is required"));
        }
        let contribution_mode = match req.scheme_type {
            SchemeType::Gold => Some(req.contribution_mode.ok_or_else(|| {
                AppError::invalid("Gold schemes need a contribution mode (amount or weight)")
            })?),
            SchemeType::Diamond => None,
        };
        let scheme = Scheme {
            id: Uuid::new_v4(),
            name: name.to_string(),
            scheme_type: req.scheme_type,
            contribution_mode,
            created_at: Utc::now(),
        };
        self.store.insert_scheme(&scheme).await?;
        self.cache.insert(scheme.id, scheme.clone()).await;
        tracing::info!("Created {} scheme {}", scheme.scheme_type, scheme.id);
        Ok(scheme)
    }
}

#[get("/schemes")]
pub async fn list_schemes(
    catalog: web::Data<SchemeCatalog>,
    _caller: Caller,
) -> Result<HttpResponse, AppError> {
    let schemes = catalog.list().await?;
    Ok(HttpResponse::Ok().json(json!({ "schemes": schemes })))
}

#[post("/schemes")]
pub async fn create_scheme(
    catalog: web::Data<SchemeCatalog>,
    caller: Caller,
    req: web::Json<NewSchemeRequest>,
) -> Result<HttpResponse, AppError> {
    caller.require_admin()?;
    let scheme = catalog.create(req.into_inner()).await?;
    Ok(HttpResponse::Created().json(json!({
        "message": "Scheme created successfully",
        "scheme": scheme,
    })))
}
