use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use discord_relay::{
    broker::RedisBroker,
    cli::{AgentCommand, AgentListenArgs, Cli, Commands, PidFileArgs, ServerCommand, ServerStartArgs},
    config::{LoadedSettings, Settings, AGENT_ID_ENV},
    daemon::{daemon_child_argv, is_daemon_child, DaemonManager},
    discord_api::DiscordClient,
    listener::{run_listener, AgentListener},
    logging::init_logging,
    prereq::{example_config, PrereqChecker},
    protocol::agent_channel,
    registry::{AgentInfo, AgentRegistry},
    routing::Dispatcher,
    server::{interaction_router, serve, InteractionState, Verification, INTERACTIONS_PATH, SHUTDOWN_GRACE},
    signature::Verifier,
    tunnel::{TunnelOptions, TunnelSupervisor},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs)?;

    match cli.command {
        Commands::Server(ServerCommand::Start(args)) => run_server_start(cli.config.as_deref(), args).await,
        Commands::Server(ServerCommand::Stop(args)) => run_server_stop(args),
        Commands::Server(ServerCommand::Status(args)) => run_server_status(args),
        Commands::Agent(AgentCommand::Listen(args)) => run_agent_listen(cli.config.as_deref(), args).await,
    }
}

async fn run_server_start(config: Option<&Path>, args: ServerStartArgs) -> Result<()> {
    if args.example {
        print!("{}", example_config());
        return Ok(());
    }

    let loaded = Settings::load(config).map(|mut loaded| {
        args.apply(&mut loaded.settings);
        loaded
    });

    let report = PrereqChecker::system().check(&loaded, args.dry_run).await;
    if args.check_prereqs {
        println!("{}", report.format_report());
        if !report.all_passed() {
            anyhow::bail!("prerequisite checks failed");
        }
        return Ok(());
    }
    if !report.all_passed() {
        eprintln!("{}", report.format_report());
        if let Some(fix) = report.format_quick_fix() {
            eprintln!("{fix}");
        }
        anyhow::bail!("cannot start server: prerequisites not met");
    }

    if args.daemon && !is_daemon_child() {
        let manager = DaemonManager::system(args.daemon_options())?;
        let pid = manager.start(&daemon_child_argv()?)?;
        println!(
            "daemon started (pid {pid}, pid file {})",
            manager.pid_path().display()
        );
        return Ok(());
    }

    let LoadedSettings { mut settings, path } = loaded?;

    let verification = if args.dry_run {
        tracing::warn!(
            target = "discord_relay::server",
            "dry-run: signature verification disabled"
        );
        Verification::Disabled
    } else {
        let verifier = Verifier::from_hex(&settings.discord.public_key)
            .context("discord.public_key is required for signature verification")?;
        Verification::Required(verifier)
    };

    let dispatcher =
        Dispatcher::from_settings(&settings.interactions).context("invalid interaction handlers")?;
    if dispatcher.is_empty() {
        tracing::warn!(target = "discord_relay::server", "no interaction handlers configured");
    } else {
        tracing::info!(
            target = "discord_relay::server",
            handlers = dispatcher.len(),
            "interaction handlers loaded"
        );
    }
    let interaction_timeout = settings.interaction_timeout()?;
    let broker = RedisBroker::connect(&settings.redis)
        .await
        .context("connect redis")?;

    let state = InteractionState::new(
        verification,
        dispatcher,
        Arc::new(broker.clone()),
        interaction_timeout,
    );
    let listener = TcpListener::bind(&settings.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.server.listen_addr))?;
    let local_addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    tokio::spawn(forward_shutdown_signal(shutdown.clone()));

    let tunnel_options = TunnelOptions::new(local_addr.to_string()).with_ngrok_auth_token(
        Some(settings.tunnel.ngrok_auth_token.clone()).filter(|token| !token.is_empty()),
    );
    let mut tunnel = TunnelSupervisor::system(tunnel_options)?
        .start(&settings.tunnel.provider, &shutdown)
        .await
        .context("failed to start tunnel")?;
    if let Some(session) = &tunnel {
        println!("Tunnel ({}) ready: {}", session.provider(), session.url());
        settings.discord.public_url = session.url().to_string();
    }

    let config_label = path
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "defaults".to_string());
    println!("Discord interaction server listening on {local_addr} (config: {config_label})");
    if !settings.discord.public_url.is_empty() {
        let public_url = settings.discord.public_url.trim_end_matches('/');
        println!("Public URL: {public_url}");
        println!("Interactions endpoint: {public_url}{INTERACTIONS_PATH}");
    }

    let served = serve(listener, interaction_router(state), shutdown.clone(), SHUTDOWN_GRACE).await;

    if let Some(session) = tunnel.as_mut() {
        if let Err(error) = session.close(&CancellationToken::new()).await {
            tracing::warn!(
                target = "discord_relay::tunnel",
                error = %error,
                "failed to close tunnel"
            );
        }
    }
    broker.close().await;
    served?;

    println!("Discord interaction server stopped");
    Ok(())
}

fn run_server_stop(args: PidFileArgs) -> Result<()> {
    let manager = DaemonManager::system(args.daemon_options())?;
    let pid = manager.stop()?;
    println!("daemon stopped (pid {pid})");
    Ok(())
}

fn run_server_status(args: PidFileArgs) -> Result<()> {
    let manager = DaemonManager::system(args.daemon_options())?;
    println!("{}", manager.status()?);
    Ok(())
}

async fn run_agent_listen(config: Option<&Path>, args: AgentListenArgs) -> Result<()> {
    let agent = args
        .resolve_agent(std::env::var(AGENT_ID_ENV).ok())
        .with_context(|| format!("agent id required (set --agent or {AGENT_ID_ENV})"))?;

    let LoadedSettings { mut settings, .. } = Settings::load(config)?;
    args.apply(&mut settings);
    if settings.discord.application_id.trim().is_empty() {
        anyhow::bail!("discord.application_id is required to edit responses");
    }

    let broker = RedisBroker::connect(&settings.redis)
        .await
        .context("connect redis")?;
    let client = DiscordClient::new(Some(&settings.discord.api_base_url))?;
    let listener = AgentListener::new(&agent, &settings.discord.application_id, Arc::new(client))?;
    let subscriber = broker.subscriber(&agent);

    let prefix = settings.redis.channel_prefix.clone();
    let channel = agent_channel(&prefix, &agent);
    let registry = AgentRegistry::new(Arc::new(broker.clone()), &prefix);
    let info = AgentInfo::for_current_process(&agent, &settings.interactions.handlers, &channel);

    let shutdown = CancellationToken::new();
    tokio::spawn(forward_shutdown_signal(shutdown.clone()));

    println!("Listening for interactions as agent {agent} (channel prefix {prefix})");
    let result = run_listener(
        &listener,
        &subscriber,
        &registry,
        info,
        args.restart_policy(),
        &shutdown,
    )
    .await;
    broker.close().await;

    result.with_context(|| format!("listening on {channel}"))
}

/// Cancel `token` on Ctrl-C or SIGTERM.
async fn forward_shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    token.cancel();
}
