//! prootbox - Entry Point
//!
//! A small CLI over the library: install, list, execute, delete.

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, fmt};

use prootbox::{Distribution, ExecRequest, ProvisionConfig, SandboxService};

/// prootbox - privilege-free Linux sandbox environments via proot.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory environments are provisioned under
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Path to the proot binary
    #[arg(long)]
    proot: Option<PathBuf>,

    /// Host directory exposed inside every sandbox
    #[arg(long)]
    shared_storage: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download, extract, and bootstrap a new environment
    Install {
        /// Distribution to provision (alpine or ubuntu)
        distribution: Distribution,

        /// Environment identifier (a short random id when omitted)
        #[arg(long)]
        id: Option<String>,
    },
    /// List environments and their installed state
    List,
    /// Run a shell command inside an installed environment
    Exec {
        /// Environment identifier
        id: String,

        /// Shell command line to run
        command: String,

        /// Working directory inside the sandbox
        #[arg(long, default_value = "/")]
        workdir: String,

        /// Timeout in milliseconds
        #[arg(long, default_value = "30000")]
        timeout_ms: u64,
    },
    /// Delete an environment's directory tree
    Delete {
        /// Environment identifier
        id: String,
    },
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    // Command output goes to stdout; logs stay on stderr.
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut config = ProvisionConfig::default();
    if let Some(base_dir) = args.base_dir {
        config = config.with_base_dir(base_dir);
    }
    if let Some(proot) = args.proot {
        config = config.with_tool_path(proot);
    }
    if let Some(storage) = args.shared_storage {
        config = config.with_shared_storage(storage);
    }
    let service = SandboxService::new(config);

    match args.command {
        Command::Install { distribution, id } => {
            let id = id.unwrap_or_else(short_id);
            info!("installing {distribution} environment {id}");

            let progress = service.subscribe_progress();
            let printer = thread::spawn(move || {
                for event in progress {
                    if event.is_out_of_band() {
                        println!("       {}", event.message);
                    } else {
                        println!("[{:>3.0}%] {}", event.fraction * 100.0, event.message);
                    }
                }
            });

            let handle = service.install_environment(distribution, &id);
            let env = handle.wait().into_diagnostic()?;
            drop(service);
            let _ = printer.join();

            println!("installed {} at {}", env.id, env.root_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            for entry in service.list_environments().into_diagnostic()? {
                let state = if entry.installed { "installed" } else { "incomplete" };
                println!("{:<20} {:<10} {}", entry.id, state, entry.path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec {
            id,
            command,
            workdir,
            timeout_ms,
        } => {
            let request = ExecRequest::new(command)
                .with_working_dir(workdir)
                .with_timeout(Duration::from_millis(timeout_ms));
            let result = service.execute(&id, &request);

            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            let code = u8::try_from(result.exit_code).unwrap_or(1);
            Ok(ExitCode::from(code))
        }
        Command::Delete { id } => {
            if service.delete_environment(&id).into_diagnostic()? {
                println!("deleted {id}");
            } else {
                println!("nothing to delete for {id}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Short random identifier for unnamed environments.
fn short_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    uuid[..8].to_string()
}
