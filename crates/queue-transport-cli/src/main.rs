use queue_transport_cli::run_cli;

#[tokio::main]
async fn main() {
    // Logging may not be initialised yet when configuration fails
    if let Err(e) = run_cli().await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
