pub mod commands;

use crate::options::ServiceOptions;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kubemetrics")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Cluster-wide resource metrics aggregation for Kubernetes", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Launch the metrics server")]
    Start(Box<ServiceOptions>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_start_flags() {
        let cli = Cli::parse_from([
            "kubemetrics",
            "-v",
            "start",
            "--metric-resolution",
            "1m",
            "--secure-port",
            "4443",
            "--kubeconfig",
            "/etc/kubernetes/admin.conf",
        ]);

        assert!(cli.verbose);
        match cli.command {
            Some(Commands::Start(options)) => {
                assert_eq!(options.metric_resolution, Duration::from_secs(60));
                assert_eq!(options.secure_serving.secure_port, 4443);
                assert_eq!(
                    options.kubeconfig.as_deref(),
                    Some(std::path::Path::new("/etc/kubernetes/admin.conf"))
                );
            }
            None => panic!("expected start command"),
        }
    }

    #[test]
    fn test_invalid_resolution_is_rejected() {
        assert!(Cli::try_parse_from(["kubemetrics", "start", "--metric-resolution", "soon"]).is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
