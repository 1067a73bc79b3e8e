use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use grievance_sla::api::{self, AppState};
use grievance_sla::cli::{Cli, Command};
use grievance_sla::clock::{Clock, SystemClock};
use grievance_sla::config::{ConfigHandle, EscalationConfig};
use grievance_sla::lifecycle::NewTicket;
use grievance_sla::repository::{LocalTicketStore, TicketRepository};
use grievance_sla::scheduler::Scheduler;
use grievance_sla::state_machine::TicketId;
use grievance_sla::{EscalationEngine, EscalationError, StatusService, Trigger, ui};

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Everything a command needs, wired from one configuration.
struct Runtime {
    config: EscalationConfig,
    handle: ConfigHandle,
    engine: Arc<EscalationEngine>,
    status: Arc<StatusService>,
}

async fn bootstrap(config_path: Option<&Path>) -> Result<Runtime> {
    let path = EscalationConfig::resolve_path(config_path);
    let config = EscalationConfig::load(Some(&path))?;
    let settings = config.settings().context("invalid configuration")?;
    let handle = if path.exists() {
        ConfigHandle::with_source(settings, &path)
    } else {
        ConfigHandle::new(settings)
    };

    let store = Arc::new(
        LocalTicketStore::open(&config.data_dir)
            .await
            .with_context(|| format!("failed to open data dir {}", config.data_dir.display()))?,
    );
    let repo: Arc<dyn TicketRepository> = store.clone();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let engine = Arc::new(EscalationEngine::new(
        Arc::clone(&repo),
        handle.clone(),
        Arc::clone(&clock),
    ));
    let status = Arc::new(StatusService::new(repo, store.audit(), handle.clone(), clock));

    Ok(Runtime {
        config,
        handle,
        engine,
        status,
    })
}

async fn execute(cli: Cli) -> Result<()> {
    if let Command::Hours { start, end } = &cli.command {
        let config = EscalationConfig::load(cli.config.as_deref())?;
        let settings = config.settings().context("invalid configuration")?;
        ui::print_hours(settings.calendar.working_hours(*start, *end));
        return Ok(());
    }

    let rt = bootstrap(cli.config.as_deref()).await?;
    let actor = cli.actor.as_str();

    match cli.command {
        Command::Serve => {
            let scheduler = Scheduler::spawn(Arc::clone(&rt.engine));
            let state = AppState::new(rt.engine, rt.status, rt.handle);
            api::serve(state, &rt.config.server.bind, async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown requested");
            })
            .await?;
            scheduler.shutdown().await;
        }
        Command::Run => {
            let progress = ui::RunProgress::start("Recalculating priorities...");
            match rt.engine.run(Trigger::manual(actor)).await {
                Ok(result) => progress.complete(&result),
                Err(e) => {
                    progress.abandon();
                    return Err(e.into());
                }
            }
        }
        Command::Audit { id } => {
            let entries = rt.status.history(&TicketId::new(id)).await?;
            ui::print_audit(&entries);
        }
        Command::Transition { id, status } => {
            let ticket = rt
                .status
                .transition(&TicketId::new(id), status.into(), actor)
                .await?;
            ui::print_ticket(&ticket);
        }
        Command::Reopen { id, reason } => {
            let ticket = rt.status.reopen(&TicketId::new(id), actor, &reason).await?;
            ui::print_ticket(&ticket);
        }
        Command::Create {
            category,
            sub_category,
            priority,
        } => {
            let new = NewTicket {
                category,
                sub_category,
                priority: priority.map(Into::into),
            };
            let ticket = rt.status.create(new, actor).await?;
            ui::print_ticket(&ticket);
        }
        Command::Hours { .. } => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<EscalationError>() {
                Some(err) => ui::print_error(err),
                None => eprintln!("Error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
