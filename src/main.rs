use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use enchive::agent;
use enchive::commands::{self, Context, KeygenOptions, StreamOptions};
use enchive::crypto::kdf;
use enchive::passphrase::TerminalPrompt;

#[derive(Parser)]
#[command(name = "enchive")]
#[command(about = "Encrypt personal archives to your own public key")]
#[command(version)]
#[command(infer_subcommands = true)]
struct Cli {
    /// Public key file (default: enchive.pub in the config directory)
    #[arg(short = 'p', long, global = true, value_name = "PATH")]
    pubkey: Option<PathBuf>,

    /// Secret key file (default: enchive.sec in the config directory)
    #[arg(short = 's', long, global = true, value_name = "PATH")]
    seckey: Option<PathBuf>,

    /// Cache the protection key in an agent; inactivity timeout in seconds
    #[arg(
        short = 'a',
        long,
        global = true,
        value_name = "SECONDS",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "900"
    )]
    agent: Option<u32>,

    /// Never consult or start a key agent
    #[arg(short = 'A', long, global = true, conflicts_with = "agent")]
    no_agent: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new key pair
    Keygen {
        /// Derive the secret key from a passphrase (cost exponent 5..=31)
        #[arg(
            short,
            long,
            value_name = "N",
            num_args = 0..=1,
            require_equals = true,
            default_missing_value = "29",
            conflicts_with = "edit",
            value_parser = clap::value_parser!(u8).range(5..=31)
        )]
        derive: Option<u8>,

        /// Rewrap the existing secret key with a new passphrase
        #[arg(short, long)]
        edit: bool,

        /// Overwrite existing key files
        #[arg(short, long)]
        force: bool,

        /// Also print the public key fingerprint
        #[arg(short = 'i', long)]
        fingerprint: bool,

        /// Protection key cost exponent (5..=31)
        #[arg(
            short = 'k',
            long,
            value_name = "N",
            default_value_t = kdf::PROTECT_COST_EXPONENT,
            value_parser = clap::value_parser!(u8).range(5..=31)
        )]
        iterations: u8,

        /// Store the secret key without passphrase protection
        #[arg(short = 'u', long)]
        plain: bool,
    },

    /// Print the public key fingerprint
    Fingerprint,

    /// Encrypt a file to the public key
    Archive {
        /// Remove the input file on success
        #[arg(short, long)]
        delete: bool,

        /// Input file (stdin when omitted)
        infile: Option<PathBuf>,

        /// Output file (default: INFILE.enchive, or stdout)
        outfile: Option<PathBuf>,
    },

    /// Decrypt an archive with the secret key
    Extract {
        /// Remove the input file on success
        #[arg(short, long)]
        delete: bool,

        /// Input file (stdin when omitted)
        infile: Option<PathBuf>,

        /// Output file (default: INFILE without its .enchive suffix)
        outfile: Option<PathBuf>,
    },

    /// Serve a cached protection key (started automatically)
    #[command(hide = true)]
    Agent {
        /// Inactivity timeout in seconds
        #[arg(long, value_name = "SECONDS")]
        timeout: u32,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();
    let ctx = Context {
        pubkey: cli.pubkey,
        seckey: cli.seckey,
        agent_timeout: if cli.no_agent {
            0
        } else {
            cli.agent.unwrap_or(0)
        },
    };

    let result = match cli.command {
        Command::Keygen {
            derive,
            edit,
            force,
            fingerprint,
            iterations,
            plain,
        } => commands::keygen(
            &ctx,
            &KeygenOptions {
                derive,
                edit,
                force,
                fingerprint,
                iterations,
                plain,
            },
            &mut TerminalPrompt,
        ),
        Command::Fingerprint => commands::fingerprint(&ctx),
        Command::Archive {
            delete,
            infile,
            outfile,
        } => commands::archive(
            &ctx,
            &StreamOptions {
                infile,
                outfile,
                delete,
            },
        ),
        Command::Extract {
            delete,
            infile,
            outfile,
        } => commands::extract(
            &ctx,
            &StreamOptions {
                infile,
                outfile,
                delete,
            },
            &mut TerminalPrompt,
        ),
        Command::Agent { timeout } => agent::run(timeout),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("enchive: {err}");
            ExitCode::FAILURE
        }
    }
}
