use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::crowd::{self, CrowdConfig, ProcessArgs, ProcessConfig, ServeArgs};

/// Real-time people counting with heatmap overlay and MJPEG streaming.
#[derive(Debug, Parser)]
#[command(name = "crowdwatch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream an annotated live feed over HTTP.
    Serve(ServeArgs),
    /// Annotate a video file and print the run summary as JSON.
    Process(ProcessArgs),
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Command::Serve(args) => crowd::serve(CrowdConfig::try_from(args)?),
            Command::Process(args) => {
                let summary = crowd::process(ProcessConfig::try_from(args)?)?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
                Ok(())
            }
        }
    }
}
