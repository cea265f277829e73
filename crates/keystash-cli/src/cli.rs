use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "keystash",
    about = "Observable key-value store with encrypted, durable and in-memory backends",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Backend to use; overrides `backend` from the config file.
    #[arg(long, global = true, value_enum)]
    pub backend: Option<BackendKind>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the JSON value stored under a key.
    Get { key: String },
    /// Store a JSON value under a key.
    Set {
        key: String,
        /// JSON document, e.g. '"text"', '42' or '{"a":1}'.
        value: String,
    },
    /// Remove a key.
    Delete { key: String },
    /// Print the value of a key and every later change.
    Watch {
        key: String,
        /// Stop after this many values.
        #[arg(long)]
        count: Option<usize>,
    },
    /// Run a write/read/delete probe against the selected backend.
    Health,
    /// Print version and exit.
    Version,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// AES-GCM encrypted files, key in the OS keyring.
    #[default]
    Secure,
    /// Plain JSON map in a single file.
    Durable,
    /// Process-local memory; nothing survives exit.
    Memory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_subcommand() {
        let cli = Cli::try_parse_from(["keystash", "get", "theme"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Get { key: "theme".into() });
        assert_eq!(cli.backend, None);
    }

    #[test]
    fn parses_set_with_json_value() {
        let cli = Cli::try_parse_from(["keystash", "set", "volume", "7"]).expect("parse should succeed");
        assert_eq!(
            cli.command,
            Command::Set {
                key: "volume".into(),
                value: "7".into()
            }
        );
    }

    #[test]
    fn parses_watch_with_count() {
        let cli = Cli::try_parse_from(["keystash", "watch", "k", "--count", "3"])
            .expect("parse should succeed");
        assert_eq!(
            cli.command,
            Command::Watch {
                key: "k".into(),
                count: Some(3)
            }
        );
    }

    #[test]
    fn backend_flag_is_global() {
        let cli = Cli::try_parse_from(["keystash", "health", "--backend", "durable"])
            .expect("parse should succeed");
        assert_eq!(cli.command, Command::Health);
        assert_eq!(cli.backend, Some(BackendKind::Durable));
    }

    #[test]
    fn rejects_unknown_backend() {
        assert!(Cli::try_parse_from(["keystash", "--backend", "cloud", "health"]).is_err());
    }

    #[test]
    fn requires_subcommand() {
        assert!(Cli::try_parse_from(["keystash"]).is_err());
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli = Cli::try_parse_from(["keystash", "config", "init"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Config(ConfigCommand::Init));
    }
}
