//! Client binary: the node whose presence the three verifiers check.

use clap::Parser;
use cpv::client::ClientRelay;
use cpv::config::PeerAddr;
use cpv::repl;

#[derive(Parser)]
#[command(name = "client", version, about = "CPV client node")]
struct Args {
    /// This client's id, e.g. `client1`.
    #[arg(long)]
    id: String,

    /// Verifiers to dial at startup, `id@host:port`, may be repeated.
    #[arg(long = "verifier", value_delimiter = ',')]
    verifiers: Vec<PeerAddr>,

    /// Dial all configured verifiers immediately instead of waiting for `connect`.
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
    let client = ClientRelay::new(args.id);

    if args.auto_connect {
        client.connect_to_verifiers(&args.verifiers).await;
    }

    repl::run_client_repl(client, args.verifiers).await;
}
