mod authz;
mod delivery;
mod directory;
mod issuance;
mod problem;
mod router;
mod sweep;
mod telemetry;
#[cfg(test)]
mod test_support;
mod worker;

use std::{net::SocketAddr, sync::Arc};

use tracing::info;
use url::Url;

use certwatch_core::{policy::ReminderCooldown, ExpiryCalculator, NotificationPolicy};
use certwatch_mailer::TemplateMailClient;
use certwatch_storage::Database;
use certwatch_util::{load_env_file, AppConfig, CooldownSetting};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let mail_client = TemplateMailClient::new(
        Url::parse(&config.mailer.base_url)?,
        config.mailer.api_key.clone(),
        config.mailer.signing_secret.clone(),
        reqwest::Client::builder().build()?,
    );
    let delivery = Arc::new(mail_client);
    let managers = Arc::new(directory::SqliteManagerDirectory::new(database.clone()));
    let authorizer = Arc::new(authz::SqliteAuthorizer::new(database.clone()));

    let cooldown = match config.reminder_cooldown {
        CooldownSetting::LeadTime => ReminderCooldown::LeadTime,
        CooldownSetting::Days(days) => ReminderCooldown::Fixed { days },
    };
    let sweep = sweep::NotificationSweep::new(
        database.clone(),
        delivery.clone(),
        managers.clone(),
        NotificationPolicy::new(cooldown),
        config.site_timezone,
    );
    let issuance = issuance::IssuanceService::new(
        database.clone(),
        authorizer,
        delivery,
        managers,
        ExpiryCalculator::new(config.site_timezone),
    );

    if let Some(interval) = config.sweep_interval {
        worker::SweepWorker::new(sweep.clone(), interval).spawn();
    } else {
        info!(stage = "worker", "sweep worker disabled");
    }

    let state = router::AppState::new(metrics, database, sweep, issuance);

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        timezone = %config.site_timezone,
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
