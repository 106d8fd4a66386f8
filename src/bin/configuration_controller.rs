//! Configuration controller: periodically drains pending CBSD requests to the SAS.

use anyhow::{Context, Result};
use clap::Parser;
use sas_domain_proxy::config::Config;
use sas_domain_proxy::crl_validator::CrlValidator;
use sas_domain_proxy::mappings::RequestType;
use sas_domain_proxy::monitor::PipelineMonitor;
use sas_domain_proxy::pipeline::Pipeline;
use sas_domain_proxy::protocol_controller::enqueue_bulk;
use sas_domain_proxy::router::{RequestRouter, SasRouter};
use sas_domain_proxy::scheduler::Scheduler;
use sas_domain_proxy::store::Store;
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn seed_store(store: &Store, path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening seed file {}", path.display()))?;
    let value: Value = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing seed file {}", path.display()))?;
    let bodies = match value {
        Value::Array(bodies) => bodies,
        body => vec![body],
    };

    let mut session = store.session()?;
    let mut total = 0;
    for (i, body) in bodies.iter().enumerate() {
        let ids = enqueue_bulk(&mut session, body).with_context(|| format!("seed body {}", i))?;
        total += ids.len();
    }
    session.commit()?;
    info!("Seeded {} requests from {}", total, path.display());
    Ok(())
}

fn main() -> Result<()> {
    let config = Config::parse();
    config.validate()?;
    tracing_subscriber::fmt().with_max_level(config.log_level()?).init();

    info!("Starting configuration controller for {}", config.sas_url);

    let store = Arc::new(match &config.database_path {
        Some(path) => Store::open_or_create(path)?,
        None => Store::in_memory(),
    });
    if let Some(path) = &config.seed_requests {
        seed_store(&store, path)?;
    }

    let monitor = Arc::new(PipelineMonitor::new());

    // Blocking HTTP clients are built before the runtime exists and outlive it.
    let tls = config.tls_files();
    let validator = Arc::new(
        CrlValidator::with_network(
            config.protected_endpoints(),
            config.crl_cache_time(),
            &tls,
            config.sas_timeout(),
        )
        .context("building CRL validator")?,
    );
    let report = validator.update_certificates();
    monitor.record_crl_refresh(report.refreshed, report.failed);

    let router: Arc<dyn SasRouter> = Arc::new(
        RequestRouter::new(
            &config.sas_url,
            config.rc_ingest_url.as_deref(),
            &tls,
            config.sas_timeout(),
            Arc::clone(&validator),
        )
        .context("building SAS router")?,
    );
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&store),
        config.request_processing_limit,
        router,
        Arc::clone(&monitor),
    ));

    let mut scheduler = Scheduler::new(Arc::clone(&monitor));
    for request_type in RequestType::ALL {
        let pipeline = Arc::clone(&pipeline);
        scheduler.add_job(
            format!("process_{}_requests", request_type.api_name()),
            config.request_processing_interval(),
            move || {
                pipeline.process_requests(request_type)?;
                Ok(())
            },
        );
    }
    {
        let validator = Arc::clone(&validator);
        let monitor = Arc::clone(&monitor);
        scheduler.add_job("update_crl", config.crl_refresh_interval(), move || {
            let report = validator.update_certificates();
            monitor.record_crl_refresh(report.refreshed, report.failed);
            Ok(())
        });
    }
    {
        let monitor = Arc::clone(&monitor);
        scheduler.add_job("emit_metrics", config.metrics_interval(), move || {
            monitor.emit();
            Ok(())
        });
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(async move {
        let handle = scheduler.start();
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        info!("Shutting down");
        handle.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })?;

    monitor.emit();
    Ok(())
}
