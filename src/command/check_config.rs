use crate::command::{self, server};
use crate::configuration::Configuration;
use argh::FromArgs;
use tracing::info;

#[derive(FromArgs, PartialEq, Debug)]
#[argh(
    subcommand,
    name = "check-config",
    description = "Validate the configuration and the material it references, then exit"
)]
pub struct Options {}

pub struct Command;

impl Command {
    /// Builds the serving components without binding anything, so that
    /// unreadable certificates or token files are reported too.
    pub fn run(config: &Configuration) -> Result<(), command::Error> {
        server::Command::new(config)?;

        info!(
            "Configuration is valid: upstream {}, issuer {}",
            config.upstream()?.url,
            config.oidc.issuer_url
        );
        println!("configuration ok");
        Ok(())
    }
}
