use clap::Parser;
use expense_projector::api::{
    Cli, Command, build_config, init_tracing, run_http_server, run_project_command,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = match build_config(cli.projection) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    match cli.command {
        Command::Serve { port } => {
            if let Err(e) = run_http_server(port, config).await {
                eprintln!("Server error: {e}");
                std::process::exit(1);
            }
        }
        Command::Project {
            templates,
            walk_start,
        } => {
            let totals = match run_project_command(&config, &templates, walk_start) {
                Ok(totals) => totals,
                Err(e) => {
                    eprintln!("Projection error: {e}");
                    std::process::exit(1);
                }
            };
            match serde_json::to_string_pretty(&totals) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Failed to serialize totals: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
