// src/main.rs
use actix_web::{App, HttpServer, middleware::Logger, web};
use sqlx::PgPool;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod auth;
mod config;
mod db;
mod error;
mod models;
mod payments;
mod rates;
mod schemes;
mod sms;
mod store;
mod subscriptions;
mod users;

use store::Store;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    tracing::info!("Starting gold savings service");

    dotenv::dotenv().ok();
    let config = config::Config::from_env().expect("Failed to load config from environment");
    tracing::debug!("Loaded {:?}", config);

    let pool = PgPool::connect(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    let store: Arc<dyn Store> = Arc::new(db::PgStore::new(pool));
    let catalog = schemes::SchemeCatalog::new(store.clone());
    let rates = rates::RateProvider::new(store.clone());
    let tokens = auth::TokenIssuer::from_config(&config);

    let subscriptions = web::Data::new(subscriptions::SubscriptionService::new(
        store.clone(),
        catalog.clone(),
        rates.clone(),
        config.term_policy,
    ));
    let verifier = payments::SignatureVerifier::new(&config.razorpay_key_secret)
        .expect("RAZORPAY_KEY_SECRET must be set");
    let payments = web::Data::new(payments::PaymentService::new(
        store.clone(),
        catalog.clone(),
        Arc::new(payments::RazorpayGateway::from_config(&config)),
        verifier,
        config.payment_currency.clone(),
    ));
    let accounts = web::Data::new(auth::AuthService::new(
        store.clone(),
        Arc::new(sms::TwilioSender::from_config(&config)),
        tokens.clone(),
        config.sms_country_code.clone(),
    ));
    let users = web::Data::new(users::UserService::new(store.clone()));
    let catalog = web::Data::new(catalog);
    let rates = web::Data::new(rates);
    let tokens = web::Data::new(tokens);

    let bind = (config.bind_address.clone(), config.port);
    tracing::info!("Listening on {}:{}", bind.0, bind.1);

    HttpServer::new(move || {
        App::new()
            .app_data(tokens.clone())
            .app_data(accounts.clone())
            .app_data(users.clone())
            .app_data(catalog.clone())
            .app_data(rates.clone())
            .app_data(subscriptions.clone())
            .app_data(payments.clone())
            .wrap(Logger::default())
            .configure(auth::init_routes)
            .configure(users::init_routes)
            .configure(schemes::init_routes)
            .configure(rates::init_routes)
            .configure(subscriptions::init_routes)
            .configure(payments::init_routes)
    })
    .bind(bind)?
    .run()
    .await
}
