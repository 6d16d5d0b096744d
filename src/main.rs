use clap::Parser;
use log::error;
use nestegg::api::{Cli, Command, run_batch, run_http_server};

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Serve { port } => run_http_server(port)
            .await
            .map_err(|e| format!("server error: {e}")),
        command => run_batch(command).map(|json| println!("{json}")),
    };

    if let Err(e) = outcome {
        error!("{e}");
        std::process::exit(1);
    }
}
