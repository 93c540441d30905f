use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use pop3sf::config::{hash_password, ServerConfig};
use pop3sf::Pop3Server;
use tracing::{error, info};

fn print_usage() {
    eprintln!("Usage: pop3sf [OPTIONS] [CONFIG_PATH]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --hash-password    Generate an Argon2id password hash for the config file");
    eprintln!("  --sample-config    Print a sample configuration file");
    eprintln!("  --help             Show this help message");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  CONFIG_PATH        Path to the configuration file (default: pop3sf.toml)");
}

fn hash_password_interactive() {
    print!("Enter password: ");
    io::stdout().flush().unwrap();

    let mut password = String::new();
    io::stdin().read_line(&mut password).unwrap();
    let password = password.trim_end_matches(['\r', '\n']);

    if password.is_empty() {
        eprintln!("Error: password cannot be empty");
        std::process::exit(1);
    }

    print!("Confirm password: ");
    io::stdout().flush().unwrap();

    let mut confirm = String::new();
    io::stdin().read_line(&mut confirm).unwrap();
    let confirm = confirm.trim_end_matches(['\r', '\n']);

    if password != confirm {
        eprintln!("Error: passwords do not match");
        std::process::exit(1);
    }

    match hash_password(password) {
        Ok(hash) => {
            println!();
            println!("Add this to your configuration under [adapter.users.\"you@example.com\"]:");
            println!("password_hash = \"{}\"", hash);
        }
        Err(e) => {
            eprintln!("Error hashing password: {}", e);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Must run before any rustls configuration is built.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let mut config_path = PathBuf::from("pop3sf.toml");
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return ExitCode::SUCCESS;
            }
            "--hash-password" => {
                hash_password_interactive();
                return ExitCode::SUCCESS;
            }
            "--sample-config" => {
                println!("{}", ServerConfig::sample());
                return ExitCode::SUCCESS;
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown option: {}", other);
                print_usage();
                return ExitCode::FAILURE;
            }
            path => config_path = PathBuf::from(path),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match ServerConfig::load(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "could not load configuration");
            return ExitCode::FAILURE;
        }
    };

    let adapter = config.build_adapter();
    let server = match Pop3Server::bind(config, adapter).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "could not start server");
            return ExitCode::FAILURE;
        }
    };

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("termination signal received");
            handle.shutdown();
        }
    });

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}
