use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use efaps::construct::{Database, PersistenceMode};
use efaps::error::Result;
use efaps::interface::EqlInterface;
use efaps::model::ModelDefinition;
use efaps::server::router;
use efaps::settings::Settings;

fn open(settings: &Settings) -> Result<Database> {
    let db = Database::new(PersistenceMode::from(settings.database.as_str()))?;
    if let Some(model) = &settings.model {
        db.install(&ModelDefinition::from_file(model)?)?;
        info!(%model, "model installed");
    }
    // fail at startup rather than on the first request
    db.cache()?;
    Ok(db)
}

#[tokio::main]
async fn main() {
    let settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db = match open(&settings) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!(error = %e, database = %settings.database, "cannot open database");
            std::process::exit(1);
        }
    };
    let interface = Arc::new(EqlInterface::new(db, settings.actor, &settings.locale));
    let listener = match tokio::net::TcpListener::bind(&settings.bind).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, bind = %settings.bind, "cannot bind");
            std::process::exit(1);
        }
    };
    info!(bind = %settings.bind, "serving EQL on /v1/eql");
    if let Err(e) = axum::serve(listener, router(interface)).await {
        error!(error = %e, "server stopped");
    }
}
