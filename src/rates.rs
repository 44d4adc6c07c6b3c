// src/rates.rs
use crate::auth::Caller;
use crate::error::{AppError, AppResult};
use crate::models::{NewRateRequest, Rate};
use crate::store::Store;
use actix_web::{HttpResponse, get, post, web};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(get_latest_rate);
    cfg.service(record_rate);
}

/// Gold rate snapshots. Only the newest record counts; nothing is cached, every
/// caller gets a fresh lookup.
#[derive(Clone)]
pub struct RateProvider {
    store: Arc<dyn Store>,
}

impl RateProvider {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn latest(&self) -> AppResult<Rate> {
        self.store
            .latest_rate()
            .await?
            .ok_or_else(|| AppError::not_found("Gold rate not found"))
    }

    pub async fn record(&self, gold_rate: f64) -> AppResult<Rate> {
        if !(gold_rate.is_finite() && gold_rate > 0.0) {
            return Err(AppError::invalid("gold_rate must be a positive number"));
        }
        let rate = Rate {
            id: Uuid::new_v4(),
            gold_rate,
            created_at: Utc::now(),
        };
        self.store.insert_rate(&rate).await?;
        tracing::info!("Recorded gold rate {}", gold_rate);
        Ok(rate)
    }
}

/// Contribution amount for a weight-based gold scheme.
pub fn amount_for_weight(weight: f64, rate: &Rate) -> f64 {
    weight * rate.gold_rate
}

#[get("/rates/latest")]
pub async fn get_latest_rate(
    rates: web::Data<RateProvider>,
    _caller: Caller,
) -> Result<HttpResponse, AppError> {
    let rate = rates.latest().await?;
    Ok(HttpResponse::Ok().json(json!({ "rate": rate })))
}

#[post("/rates")]
pub async fn record_rate(
    rates: web::Data<RateProvider>,
    caller: Caller,
    req: web::Json<NewRateRequest>,
) -> Result<HttpResponse, AppError> {
    caller.require_admin()?;
    let rate = rates.record(req.gold_rate).await?;
    Ok(HttpResponse::Created().json(json!({
        "message": "Gold rate recorded successfully",
        "rate": rate,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::Duration;

    #[tokio::test]
    async fn latest_is_not_found_when_empty() {
        let provider = RateProvider::new(Arc::new(MemoryStore::new()));
        let err = provider.latest().await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn latest_picks_most_recently_created() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        for (rate, age) in [(6100.0, 2), (6250.0, 0), (5900.0, 5)] {
            store
                .insert_rate(&Rate {
                    id: Uuid::new_v4(),
                    gold_rate: rate,
                    created_at: now - Duration::hours(age),
                })
                .await
                .unwrap();
        }
        let provider = RateProvider::new(store);
        assert_eq!(provider.latest().await.unwrap().gold_rate, 6250.0);
    }

    #[tokio::test]
    async fn record_rejects_non_positive_rates() {
        let provider = RateProvider::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            provider.record(0.0).await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            provider.record(f64::NAN).await,
            Err(AppError::InvalidInput(_))
        ));
        provider.record(6000.0).await.unwrap();
        assert_eq!(provider.latest().await.unwrap().gold_rate, 6000.0);
    }

    #[test]
    fn weight_times_rate() {
        let rate = Rate {
            id: Uuid::new_v4(),
            gold_rate: 6000.0,
            created_at: Utc::now(),
        };
        assert_eq!(amount_for_weight(2.0, &rate), 12000.0);
        assert_eq!(amount_for_weight(0.5, &rate), 3000.0);
    }
}
