use std::process;

use cachegraph::{
    cache::{CacheConfig, CachingBackend, NamedLockRegistry},
    config::{self, LoadError},
    error::CacheError,
    infra::{error::InfraError, telemetry},
    soak::{self, SoakPlan},
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("soak run failed: {0}")]
    Cache(#[from] CacheError),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Soak(config::SoakArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Soak(args) => {
            let cache = CacheConfig::from(&settings.cache);
            let backend = CachingBackend::memory(&cache);
            let locks = NamedLockRegistry::new();
            soak::run(&backend, &locks, &SoakPlan::from(&args)).await?;
            Ok(())
        }
    }
}
