// Entrypoint for the CLI application.
// - Parses arguments, installs logging and loads the config.
// - `send2boox FILE` uploads and registers FILE, then prints the listing;
//   the subcommands cover listing, login and deleting.
// - Returns `anyhow::Result` so every failure ends as one readable message.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use send2boox::{ui, Boox, Config};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "send2boox")]
#[command(version)]
#[command(about = "Send files to a Boox cloud account", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Verification code, used to log in when no token is configured
    #[arg(long)]
    code: Option<String>,

    /// File to upload and register
    file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the remote file listing
    List {
        /// Number of entries (defaults to page_size from the config)
        #[arg(long)]
        limit: Option<u32>,

        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Mail a one-time verification code
    RequestCode {
        /// Account email (defaults to the configured one)
        email: Option<String>,
    },

    /// Exchange email and verification code for a token
    Login {
        /// Account email (defaults to the configured one)
        #[arg(long)]
        email: Option<String>,

        /// Verification code; requested and prompted for when omitted
        #[arg(long)]
        code: Option<String>,

        /// Write the token to the config file without asking
        #[arg(long)]
        save: bool,
    },

    /// Delete files by listing id
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,

        /// Do not ask for confirmation
        #[arg(long, short)]
        yes: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "send2boox=debug"
    } else {
        "send2boox=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(Config::default_config_path);
    let mut config = Config::load(Some(config_path.clone()))
        .with_context(|| format!("could not load {}", config_path.display()))?;

    match cli.command {
        Some(Commands::List { limit, offset }) => {
            let boox = ui::connect(&mut config, None)?;
            let listing = boox.list_files(limit.unwrap_or(config.page_size), offset)?;
            ui::print_listing(&listing);
        }
        Some(Commands::RequestCode { email }) => {
            let email = match email.or_else(|| config.email.clone()) {
                Some(email) => email,
                None => ui::prompt_email(None)?,
            };
            Boox::request_verification_code(&config, &email)
                .with_context(|| format!("could not request a code for {}", email))?;
            println!("A verification code was sent to {}.", email);
        }
        Some(Commands::Login { email, code, save }) => {
            ui::login(&mut config, email, code)?;
            ui::maybe_save_config(&config, &config_path, save)?;
        }
        Some(Commands::Delete { ids, yes }) => {
            if !ui::confirm_delete(&ids, yes)? {
                return Ok(());
            }
            let boox = ui::connect(&mut config, None)?;
            boox.delete_files(&ids)?;
            println!("Deleted {} file(s).", ids.len());
        }
        None => {
            if let Some(file) = &cli.file {
                if !file.is_file() {
                    bail!("{} is not a file", file.display());
                }
            }

            let had_token = config.token().is_some();
            let mut boox = ui::connect(&mut config, cli.code.clone())?;
            if !had_token {
                ui::maybe_save_config(&config, &config_path, false)?;
            }

            if let Some(file) = &cli.file {
                ui::send_file(&mut boox, file)?;
            }
            let listing = boox.list_files(config.page_size, 0)?;
            ui::print_listing(&listing);
        }
    }

    Ok(())
}
