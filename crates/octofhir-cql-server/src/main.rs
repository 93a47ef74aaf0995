use clap::Parser;
use octofhir_cql_server::ServerBuilder;
use octofhir_cql_server::config::{DEFAULT_CONFIG_FILE, loader::load_config};

/// CQL to ELM translation service.
#[derive(Debug, Parser)]
#[command(name = "octofhir-cql-server", version, about)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "OCTOFHIR_CQL_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Overrides server.port from the configuration
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    // .env is optional
    if let Err(e) = dotenvy::dotenv()
        && !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
    {
        eprintln!("Warning: Failed to load .env file: {e}");
    }

    let cli = Cli::parse();

    octofhir_cql_server::observability::init_tracing();

    let mut cfg = match load_config(Some(&cli.config)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    if let Some(port) = cli.port {
        cfg.server.port = port;
    }

    tracing::info!(path = %cli.config, "Configuration loaded");
    octofhir_cql_server::observability::apply_logging_level(&cfg.logging.level);

    let server = match ServerBuilder::new().with_config(cfg).build() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Server initialization failed: {e}");
            std::process::exit(2);
        }
    };

    if let Err(err) = server.run().await {
        eprintln!("Server error: {err}");
        std::process::exit(1);
    }
}
