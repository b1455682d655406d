use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use trapmux::actions::PluginRegistry;
use trapmux::config::{ConfigSource, Overrides};
use trapmux::listener::ReplayDecoder;
use trapmux::secrets::EnvSecrets;
use trapmux::Daemon;

#[derive(Parser)]
#[command(name = "trapmux")]
#[command(about = "SNMP trap multiplexer and filtering daemon")]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// Location of the trapmux configuration file (or http(s) URL)
    #[arg(short = 'c', value_name = "FILE", default_value = "/opt/trapmux/etc/trapmux.yml")]
    pub config: String,

    /// Override the bind IP address on which to listen for incoming traps
    #[arg(short = 'b', value_name = "BIND_IP")]
    pub bind_addr: Option<String>,

    /// Override the UDP port on which to listen for incoming traps
    #[arg(short = 'p', value_name = "PORT")]
    pub listen_port: Option<u16>,

    /// Enable debug mode (produces very verbose runtime output)
    #[arg(short = 'd')]
    pub debug: bool,

    /// Print the version of trapmux and exit
    #[arg(short = 'v')]
    pub version: bool,
}

pub async fn run(cli: Cli) -> Result<()> {
    if cli.version {
        println!("This is trapmux version {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // TRAPMUX_CONFIG_URI beats the -c flag.
    let uri = std::env::var("TRAPMUX_CONFIG_URI").unwrap_or(cli.config);
    let source = ConfigSource::from_uri(&uri);
    let overrides = Overrides {
        bind_addr: cli.bind_addr,
        listen_port: cli.listen_port,
        debug: cli.debug,
    };

    let daemon = Daemon::start(
        source,
        overrides,
        PluginRegistry::builtin(),
        Arc::new(EnvSecrets),
        Arc::new(ReplayDecoder),
    )
    .await?;

    tokio::select! {
        result = daemon.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            daemon.shutdown().await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_short_flags() {
        let cli = Cli::parse_from(["trapmux", "-c", "/etc/t.yml", "-b", "10.0.0.1", "-p", "10162", "-d"]);
        assert_eq!(cli.config, "/etc/t.yml");
        assert_eq!(cli.bind_addr.as_deref(), Some("10.0.0.1"));
        assert_eq!(cli.listen_port, Some(10162));
        assert!(cli.debug);
        assert!(!cli.version);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["trapmux"]);
        assert_eq!(cli.config, "/opt/trapmux/etc/trapmux.yml");
        assert!(cli.bind_addr.is_none());
        assert!(cli.listen_port.is_none());
    }
}
