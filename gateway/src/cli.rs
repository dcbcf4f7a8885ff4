use clap::{Parser, Subcommand};

/// chatgate: OpenAI-compatible chat gateway
#[derive(Parser)]
#[command(name = "chatgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Address to bind (overrides CHATGATE_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (overrides CHATGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage caller access tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Authorize the upstream session interactively
    Login,

    /// Forget the stored upstream session and grant
    Logout,
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Issue a new access token
    Create {
        #[arg(long, default_value = "")]
        label: String,
    },
    /// List issued tokens
    List,
    /// Revoke a token (it stays listed as inactive)
    Revoke {
        #[arg(long)]
        id: String,
    },
    /// Delete a token record
    Delete {
        #[arg(long)]
        id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_token_create_with_label() {
        let cli = Cli::parse_from(["chatgate", "token", "create", "--label", "ci"]);
        match cli.command {
            Some(Commands::Token {
                command: TokenCommands::Create { label },
            }) => assert_eq!(label, "ci"),
            _ => panic!("expected token create"),
        }
    }

    #[test]
    fn serve_overrides_are_optional() {
        let cli = Cli::parse_from(["chatgate", "serve"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Serve { host: None, port: None })
        ));
    }
}
