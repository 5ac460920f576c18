//! Deliver mails scheduled in the `mail` table over SMTP.
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use futures::future::{select, Either};
use health::HealthRegistry;
use tracing_subscriber::EnvFilter;

use mail_common::{metrics, pgqueue::MailQueue};
use mail_worker::config::Config;
use mail_worker::directory::PgDirectory;
use mail_worker::message::{MailComposer, SenderSettings};
use mail_worker::reply::SharedReplyAddress;
use mail_worker::transport::build_transport;
use mail_worker::worker::MailWorker;

async fn index() -> &'static str {
    "mail worker"
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    config.validate().wrap_err("invalid configuration")?;

    let liveness = HealthRegistry::new("liveness");

    let queue = MailQueue::new(
        &config.database_url,
        config.max_pg_connections,
        "mail-worker",
    )
    .wrap_err("failed to initialize queue")?
    .processing_timeout(config.processing_timeout.0);

    let transport = build_transport(&config.smtp, config.send_timeout.0)
        .wrap_err("failed to initialize smtp transport")?;
    let composer = MailComposer::new(
        Arc::new(PgDirectory::new(queue.pool().clone())),
        Arc::new(SharedReplyAddress::new(&config.smtp.smtp_messages_from)),
        SenderSettings::new(
            &config.smtp.smtp_noreply_from,
            config.smtp.thread_ref_prefix.as_str(),
        ),
    );

    let worker = MailWorker::new(
        config.worker_name.as_str(),
        &queue,
        config.poll_interval.0,
        config.send_timeout.0,
        config.max_concurrent_jobs,
        config.retry_policy.provide(),
        composer,
        transport,
        liveness.clone(),
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        );
    let router =
        metrics::setup_metrics_routes(router).wrap_err("failed to install metrics recorder")?;
    let bind = config.bind();
    let http_server = Box::pin(metrics::serve(router, &bind));
    let worker_loop = Box::pin(worker.run());

    match select(http_server, worker_loop).await {
        Either::Left((listen_result, _)) => {
            listen_result.wrap_err("mail-worker http server exited")?;
            tracing::error!("mail-worker http server exited");
        }
        Either::Right((_, _)) => {
            tracing::error!("mail-worker polling loops exited")
        }
    };

    Ok(())
}
