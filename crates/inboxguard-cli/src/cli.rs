//! Command-line definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_PATH;

/// InboxGuard: secure credential vault and Gmail connector.
#[derive(Parser, Debug)]
#[command(
    name = "inboxguard",
    version,
    about = "InboxGuard: encrypted credential vault and Gmail connector",
    long_about = "Connects a Gmail account through OAuth, keeps its tokens encrypted in the \
                  local vault, and rotates them before they expire."
)]
pub struct Cli {
    /// Configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// The configuration path and whether the user named it.
    pub fn config_path(&self) -> (PathBuf, bool) {
        match &self.config {
            Some(path) => (path.clone(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print vault, token, rotation and provider health as JSON.
    Status,

    /// Sign in to the account through the browser.
    Connect {
        /// Run the consent flow even if valid tokens are stored.
        #[arg(long)]
        force: bool,

        /// Additional scope to request on top of the configured ones.
        #[arg(long = "scope", value_name = "SCOPE")]
        scopes: Vec<String>,
    },

    /// Revoke the grant and delete every stored token.
    Disconnect,

    /// Rotate tokens in the background until Ctrl-C.
    Run,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_connect_with_extra_scopes() {
        let cli = Cli::try_parse_from([
            "inboxguard",
            "connect",
            "--force",
            "--scope",
            "https://www.googleapis.com/auth/gmail.modify",
        ])
        .unwrap();
        match &cli.command {
            Commands::Connect { force, scopes } => {
                assert!(*force);
                assert_eq!(
                    *scopes,
                    vec!["https://www.googleapis.com/auth/gmail.modify".to_string()]
                );
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.config_path(), (PathBuf::from(DEFAULT_CONFIG_PATH), false));
    }

    #[test]
    fn config_flag_works_after_subcommand() {
        let cli = Cli::try_parse_from(["inboxguard", "status", "--config", "/etc/ig.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));
        assert_eq!(cli.config_path(), (PathBuf::from("/etc/ig.toml"), true));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["inboxguard"]).is_err());
    }
}
