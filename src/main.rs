use clap::Parser;
use ssh_exec_proxy::app::App;
use ssh_exec_proxy::errors::ProxyError;
use ssh_exec_proxy::services::config::ProxyConfig;
use ssh_exec_proxy::services::logger::{LogLevel, Logger};

#[derive(Parser, Debug)]
#[command(name = "ssh-exec-proxy", version, about = "Runs remote commands over SSH behind an HTTP upgrade")]
struct Args {
    /// Listen address, overrides SSH_PROXY_BIND.
    #[arg(long)]
    bind: Option<String>,

    /// error, warn, info or debug. Overrides SSH_PROXY_LOG_LEVEL.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut logger = Logger::new("ssh-exec-proxy");
    if let Some(raw) = args.log_level.as_deref() {
        match LogLevel::parse(raw) {
            Some(level) => logger.set_level(level),
            None => {
                eprintln!("ssh-exec-proxy: unknown log level {}", raw);
                std::process::exit(2);
            }
        }
    }

    let result = run(args.bind.as_deref(), logger.clone()).await;
    if let Err(err) = result {
        logger.error("fatal", Some(&serde_json::json!({ "error": err.message, "hint": err.hint })));
        eprintln!("ssh-exec-proxy: {}", err);
        std::process::exit(1);
    }
}

async fn run(bind: Option<&str>, logger: Logger) -> Result<(), ProxyError> {
    let mut config = ProxyConfig::from_env()?;
    if let Some(bind) = bind {
        config = config.with_bind_address(bind)?;
    }
    App::initialize(config, logger)?.serve().await
}
