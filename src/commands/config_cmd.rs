use clap::{Args, Subcommand};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::OutputFormat;
use crate::config::Config;

const DEFAULT_CONFIG: &str = r#"# meals configuration

# Path to the SQLite queue database (default: platform data dir, meals.db)
# database_path: ~/.local/share/meals/meals.db

sync:
  # server_url: "https://meals.example.com"
  # api_key: "your-api-key"
  # Sync right after logging, editing or deleting a meal
  auto_sync: false
  # First automatic retry delay; doubles on each retry
  # retry_base_delay_ms: 1000
  # max_retries: 5
  # How often 'meals sync watch' checks the server
  # poll_interval_secs: 30
  # request_timeout_secs: 10
"#;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Initialize configuration file
    Init,
}

impl ConfigCommand {
    pub fn run(
        &self,
        config: &Config,
        cli_config_path: Option<PathBuf>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            let path = cli_config_path.unwrap_or_else(Config::default_config_path);
                            println!("Config file: {} (not found)", path.display());
                        }
                        println!();

                        println!("database_path: {}", config.database_path.value.display());
                        println!("  source: {}", config.database_path.source);
                        println!();

                        let sync = &config.sync;
                        println!(
                            "sync.server_url: {}",
                            sync.server_url.as_deref().unwrap_or("(not set)")
                        );
                        println!(
                            "sync.api_key: {}",
                            if sync.api_key.is_some() {
                                "(set)"
                            } else {
                                "(not set)"
                            }
                        );
                        println!("sync.auto_sync: {}", sync.auto_sync);
                        println!("sync.retry_base_delay_ms: {}", sync.retry_base_delay_ms);
                        println!("sync.max_retries: {}", sync.max_retries);
                        println!("sync.poll_interval_secs: {}", sync.poll_interval_secs);
                        println!("sync.request_timeout_secs: {}", sync.request_timeout_secs);
                    }
                }
                Ok(())
            }

            ConfigSubcommand::Init => {
                let config_path = cli_config_path.unwrap_or_else(Config::default_config_path);

                if config_path.exists() {
                    println!("Config file already exists: {}", config_path.display());
                    println!("Use 'meals config show' to view current configuration.");
                    return Ok(());
                }

                write_default_config(&config_path)?;

                println!("Created config file: {}", config_path.display());
                println!("\nEdit this file to customize your settings.");
                Ok(())
            }
        }
    }
}

fn write_default_config(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    file.write_all(DEFAULT_CONFIG.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSource;

    #[test]
    fn test_default_config_loads_as_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.yaml");

        write_default_config(&config_path).unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(config.config_file, Some(config_path));
        assert_eq!(config.database_path.source, ConfigSource::Default);
        assert_eq!(config.sync.max_retries, 5);
        assert!(!config.sync.auto_sync);
    }
}
