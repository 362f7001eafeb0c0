use std::net::SocketAddr;
use std::sync::Arc;

use duka_backend::api::{self, AppState};
use duka_backend::config::Config;
use duka_backend::database::order_store::{OrderStore, PgOrderStore};
use duka_backend::database::payment_repository::{PaymentStore, PgPaymentStore};
use duka_backend::database::{self, PoolConfig};
use duka_backend::error;
use duka_backend::payments::gateway::PaymentGateway;
use duka_backend::payments::orchestrator::PaymentOrchestrator;
use duka_backend::payments::poller::StatusPoller;
use duka_backend::payments::providers::{DarajaGateway, ImpalaGateway};
use duka_backend::payments::reconciler::CallbackReconciler;
use duka_backend::payments::types::ProviderName;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duka_backend=info,tower_http=info".into()),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;
    error::set_environment(&config.server.environment);

    tracing::info!("Starting Duka Backend");
    tracing::info!("Environment: {}", config.server.environment);
    tracing::info!("Payment provider: {}", config.payment.provider);

    // Database pool and stores
    let pool = database::init_pool(
        &config.database.url,
        Some(PoolConfig {
            max_connections: config.database.max_connections,
            ..PoolConfig::default()
        }),
    )
    .await?;
    let payments: Arc<dyn PaymentStore> = Arc::new(PgPaymentStore::new(pool.clone()));
    let orders: Arc<dyn OrderStore> = Arc::new(PgOrderStore::new(pool));

    // Configured gateway
    let gateway: Arc<dyn PaymentGateway> = match config.payment.provider {
        ProviderName::Daraja => {
            let daraja_config = config
                .payment
                .daraja
                .clone()
                .ok_or("Daraja selected but not configured")?;
            Arc::new(DarajaGateway::new(daraja_config)?)
        }
        ProviderName::Impala => {
            let impala_config = config
                .payment
                .impala
                .clone()
                .ok_or("Impala Pay selected but not configured")?;
            Arc::new(ImpalaGateway::new(impala_config)?)
        }
    };

    // Orchestration components
    let reconciler = Arc::new(CallbackReconciler::new(
        Arc::clone(&payments),
        Arc::clone(&orders),
    ));
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        Arc::clone(&payments),
        Arc::clone(&orders),
        Arc::clone(&gateway),
    ));
    let poller = Arc::new(StatusPoller::new(
        Arc::clone(&payments),
        Arc::clone(&gateway),
        Arc::clone(&reconciler),
    ));

    let app = api::router(AppState {
        orchestrator,
        reconciler,
        poller,
        payments,
        orders,
    });

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
