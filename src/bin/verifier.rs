//! Verifier binary: one of the three corners of the CPV triangle.

use clap::Parser;
use cpv::config::NodeConfig;
use cpv::node::Verifier;
use cpv::repl;

#[derive(Parser)]
#[command(name = "verifier", version, about = "CPV verifier node")]
struct Args {
    #[command(flatten)]
    config: NodeConfig,

    /// Dial all configured peers immediately instead of waiting for `connect`.
    #[arg(long)]
    auto_connect: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("cpv=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let verifier = match Verifier::start(&args.config).await {
        Ok(verifier) => verifier,
        Err(e) => {
            tracing::error!(error = %e, "failed to start verifier");
            std::process::exit(1);
        }
    };

    if args.auto_connect {
        verifier.connect_to_peers(&args.config.peers).await;
    }

    repl::run_verifier_repl(verifier, args.config.peers).await;
}
