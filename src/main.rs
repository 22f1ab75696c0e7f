use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use runjail::config::CliArgs;
use runjail::executor::Executor;
use runjail::rules::RuleRegistry;
use runjail::sandbox::{Watchdog, create_isolator};
use runjail::scheduler::Scheduler;
use runjail::staging::Stager;
use runjail::web_server::build_server;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&cli.log_level));

    let config = cli.to_config().context("failed to load configuration")?;
    let registry = RuleRegistry::load(&cli.rules_path)
        .with_context(|| format!("failed to load rules from {}", cli.rules_path.display()))?;
    log::info!("Loaded {} language rules", registry.languages().count());

    let (sources_dir, artifacts_dir) = config.scratch.resolve_roots()?;
    let stager = Stager::new(&sources_dir, &artifacts_dir).context("invalid scratch roots")?;
    let isolator = create_isolator(&config.isolator).context("failed to create isolator")?;
    let watchdog = Watchdog::from(&config.watchdog);
    let executor = Arc::new(Executor::new(stager, isolator, watchdog));

    // ======= PREPARATION END, EXECUTION START =======

    let scheduler = Arc::new(Scheduler::start(
        &config.scheduler,
        config.scratch.sources_size_limit_bytes,
        Arc::new(registry),
        executor,
    ));

    let server = build_server(&config.server, scheduler.clone()).context("failed to build server")?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {res_server:?}");
        }
    }

    // 1. Stop accepting requests; in-flight ones still get their result
    let stop = server_handle.stop(true);

    // 2. Fail queued submissions and stop the workers once idle
    scheduler.shutdown();
    scheduler.join().await;
    stop.await;

    log::info!("Shutdown complete");
    Ok(())
}
