use std::path::Path;
use std::process::{Child, Command as Process};

use chrono::Utc;
use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use tracing::{debug, info};

use envstore::EnvironmentRequest;
use runcoord::cli::{Cli, Command, EnvironmentArgs};
use runcoord::config::{Config, ENV_DIR, ENV_ENABLED};
use runcoord::coordination::CoordinationManager;
use runcoord::discovery::PatternDiscovery;
use runcoord::session::{ENV_WORKER_ID, ENV_WORKERS, Role, Session};

fn setup_logging(verbose: u8, config_debug: bool) -> Result<()> {
    let level = match (verbose, config_debug) {
        (0, false) => tracing::Level::INFO,
        (0, true) | (1, _) => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to install tracing subscriber: {}", e))?;

    debug!(?level, "Logging initialized");
    Ok(())
}

fn request(env: &EnvironmentArgs) -> EnvironmentRequest {
    EnvironmentRequest::new(&env.environment, &env.packages, &env.language_version)
}

/// Start the wrapped command with the coordination variables its workers need
fn spawn_command(command: &[String], config: &Config, root: &Path, workers: usize) -> Result<Option<Child>> {
    let Some((program, args)) = command.split_first() else {
        return Ok(None);
    };
    info!(%program, ?args, "Starting command");
    let child = Process::new(program)
        .args(args)
        .env(ENV_ENABLED, "1")
        .env(ENV_WORKERS, workers.to_string())
        .env(ENV_DIR, config.coordination_dir(root))
        .env_remove(ENV_WORKER_ID)
        .spawn()
        .context(format!("Failed to start command: {}", program))?;
    Ok(Some(child))
}

fn run_controller(
    config: Config,
    root: &Path,
    workers: usize,
    env: EnvironmentArgs,
    command: Vec<String>,
) -> Result<()> {
    let mut child = spawn_command(&command, &config, root, workers)?;

    let started = Session::start(
        &config,
        Role::Controller { workers },
        root,
        &env.store,
        &request(&env),
        Box::new(PatternDiscovery::default()),
    );
    let session = match started {
        Ok(session) => session,
        Err(e) => {
            if let Some(child) = child.as_mut() {
                let _ = child.kill();
                let _ = child.wait();
            }
            return Err(e).context("Controller pre-creation failed");
        }
    };

    if let Session::Controller(controller) = &session {
        let prepared = controller.prepared();
        println!(
            "{} Environment {} (id {}, {})",
            "✓".green(),
            prepared.environment.name.cyan(),
            prepared.environment.id,
            prepared.resolution
        );
        println!("  Test files: {}", prepared.state.test_files.len());
        let acks = format!("{}/{}", prepared.acknowledged, workers);
        if prepared.all_acknowledged {
            println!("  Workers ready: {}", acks.green());
        } else {
            println!("  Workers ready: {} {}", acks.yellow(), "(timed out, continuing)".dimmed());
        }
    }

    let status = child
        .map(|mut child| child.wait().context("Failed to wait for command"))
        .transpose()?;

    session.finish();

    if let Some(status) = status
        && !status.success()
    {
        bail!("Command exited with {}", status);
    }
    Ok(())
}

fn run_worker(config: Config, root: &Path, id: String, env: EnvironmentArgs) -> Result<()> {
    let session = Session::start(
        &config,
        Role::Worker { id: id.clone() },
        root,
        &env.store,
        &request(&env),
        Box::new(PatternDiscovery::default()),
    )
    .context(format!("Worker {} failed to start", id))?;

    let environment = session.environment();
    let mode = if session.store().is_read_only() { "read-only" } else { "read-write" };
    println!(
        "{} Worker {} using environment {} (id {}, {})",
        "✓".green(),
        id.cyan(),
        environment.name.cyan(),
        environment.id,
        mode
    );
    if let Session::Worker(worker) = &session {
        println!("  Resolution: {}", worker.resolved().resolution);
        println!("  Test files: {}", worker.coordination().test_files().len());
    }
    session.finish();
    Ok(())
}

fn show_status(config: Config, root: &Path) -> Result<()> {
    let manager = CoordinationManager::new(root, config);
    println!("Coordination directory: {}", manager.dir().display().to_string().cyan());

    match manager.read_state() {
        Some(state) => {
            let age = state.age_at(Utc::now());
            println!("{} Controller state published {:.1}s ago", "✓".green(), age.as_secs_f64());
            println!("  Environment id: {}", state.environment_id);
            println!("  Store: {}", state.store_path.display());
            println!("  Controller pid: {}", state.controller_pid);
            println!("  Test files: {}", state.test_files.len());
            let ready = manager.ready_workers();
            println!("  Workers ready: {}/{}", ready.len(), state.expected_worker_count);
            for worker in ready {
                println!("    {}", worker.yellow());
            }
        }
        None => println!("{} No controller state", "✗".red()),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());
    setup_logging(cli.verbose, config.debug).context("Failed to setup logging")?;

    let root = cli.root.as_path();
    debug!(?root, command = ?cli.command, "runcoord starting");

    match cli.command {
        Command::Controller { workers, env, command } => {
            let config = Config { enabled: true, ..config };
            run_controller(config, root, workers, env, command)
        }
        Command::Worker { id, env } => {
            let config = Config { enabled: true, ..config };
            run_worker(config, root, id, env)
        }
        Command::Status => show_status(config, root),
        Command::Cleanup => {
            let manager = CoordinationManager::new(root, config);
            manager.cleanup();
            println!("{} Removed {}", "✓".green(), manager.dir().display());
            Ok(())
        }
        Command::Config => {
            let yaml = config.to_yaml().context("Failed to serialize configuration")?;
            print!("{}", yaml);
            Ok(())
        }
    }
}
