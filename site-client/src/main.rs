//! sitectl - drive the site's auth flows from the command line.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use site_client::auth::RouteGuard;
use site_client::reconcile::ProfileReconciler;
use site_client::views::{self, Access};
use site_client::{AuthFacade, Config, FileStorage, GuardState, HostedIdentity, HostedRecordStore};
use site_common::Role;

#[derive(Parser, Debug)]
#[command(name = "sitectl", version, about = "Drive the site's auth flows")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Sign in with email and password
    Login { email: String, password: String },
    /// Create an account and its profile
    Register {
        email: String,
        password: String,
        name: String,
        username: String,
        /// Register with the admin role
        #[arg(long)]
        admin: bool,
    },
    /// Clear every local session
    Logout,
    /// Whether a session is held, and how many profiles are pending
    Status,
    /// The signed-in identity merged with its profile
    Whoami,
    /// Request a password reset email
    ResetPassword { email: String },
    /// Evaluate the route guard for a view path
    Guard { path: String },
    /// Write pending profiles
    Reconcile {
        /// Keep reconciling on the configured interval until interrupted
        #[arg(long)]
        watch: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = Config::load()
        .map_err(|e| format!("Failed to load configuration: {}", e))?;

    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let timeout = Duration::from_secs(config.backend.timeout_secs);
    let identity = Arc::new(HostedIdentity::new(&config.backend.url, timeout)?);
    let records = Arc::new(HostedRecordStore::new(&config.backend.url, timeout)?);
    let storage = Arc::new(FileStorage::open(&config.storage.path)?);
    let facade = Arc::new(AuthFacade::new(identity, records, storage, &config)?);

    tracing::debug!("Using backend {}", config.backend.url);

    run(cli.command, facade, &config).await
}

async fn run(
    command: Command,
    facade: Arc<AuthFacade>,
    config: &Config,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match command {
        Command::Login { email, password } => {
            let outcome = facade.login(&email, &password).await;
            print_json(&outcome)?;
            Ok(exit_code(outcome.success))
        }
        Command::Register {
            email,
            password,
            name,
            username,
            admin,
        } => {
            let role = if admin { Role::Admin } else { Role::User };
            let outcome = facade
                .register(&email, &password, &name, &username, role)
                .await;
            print_json(&outcome)?;
            Ok(exit_code(outcome.success))
        }
        Command::Logout => {
            facade.logout().await;
            println!("Signed out");
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let authenticated = facade.is_authenticated().await;
            let pending = facade.journal().pending()?.len();
            print_json(&serde_json::json!({
                "authenticated": authenticated,
                "pending_profiles": pending,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Whoami => match facade.current_user_with_profile().await {
            Some(current) => {
                print_json(&serde_json::json!({
                    "user": current.user,
                    "profile": current.profile,
                    "role": current.role(),
                }))?;
                Ok(ExitCode::SUCCESS)
            }
            None => {
                println!("Not signed in");
                Ok(ExitCode::FAILURE)
            }
        },
        Command::ResetPassword { email } => {
            let outcome = facade.reset_password(&email).await;
            print_json(&outcome)?;
            Ok(exit_code(outcome.success))
        }
        Command::Guard { path } => {
            let Some(view) = views::find(&path) else {
                eprintln!("No view matches {}", path);
                return Ok(ExitCode::FAILURE);
            };
            match view.access {
                Access::Public => {
                    print_json(&serde_json::json!({"view": view.name, "state": "public"}))?;
                    Ok(ExitCode::SUCCESS)
                }
                Access::Guarded(requirement) => {
                    let state = RouteGuard::new(facade.clone(), requirement).check().await;
                    print_json(&serde_json::json!({"view": view.name, "guard": state}))?;
                    Ok(exit_code(state == GuardState::Authorized))
                }
            }
        }
        Command::Reconcile { watch: false } => {
            let reconciler =
                ProfileReconciler::new(facade.profiles().clone(), facade.journal().clone());
            let report = reconciler.run_once().await?;
            print_json(&report)?;
            Ok(exit_code(report.failed == 0))
        }
        Command::Reconcile { watch: true } => {
            let every = Duration::from_secs(config.reconcile.interval_secs);
            tracing::info!("Reconciling pending profiles every {:?}", every);
            let reconciler = Arc::new(ProfileReconciler::new(
                facade.profiles().clone(),
                facade.journal().clone(),
            ));
            let handle = reconciler.spawn(every);
            tokio::signal::ctrl_c().await?;
            handle.abort();
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command, clap::Error> {
        Cli::try_parse_from(std::iter::once("sitectl").chain(args.iter().copied()))
            .map(|cli| cli.command)
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_register_admin_flag() {
        let command = parse(&["register", "a@x.com", "pw", "Ann", "ann", "--admin"]).unwrap();
        assert_eq!(
            command,
            Command::Register {
                email: "a@x.com".to_string(),
                password: "pw".to_string(),
                name: "Ann".to_string(),
                username: "ann".to_string(),
                admin: true,
            }
        );
    }

    #[test]
    fn test_unknown_flags_are_rejected() {
        assert!(parse(&["register", "a@x.com", "pw", "Ann", "ann", "--adminn"]).is_err());
        assert!(parse(&["logout", "--force"]).is_err());
        assert!(parse(&["login", "a@x.com"]).is_err());
    }

    #[test]
    fn test_kebab_case_commands() {
        assert_eq!(
            parse(&["reset-password", "a@x.com"]).unwrap(),
            Command::ResetPassword {
                email: "a@x.com".to_string()
            }
        );
        assert_eq!(
            parse(&["reconcile", "--watch"]).unwrap(),
            Command::Reconcile { watch: true }
        );
    }
}
