//! callfx CLI tools: effects config, image shrinking, call demos.

#![forbid(unsafe_code)]

mod call;
mod config_cmd;
mod feed;
mod media;

use std::path::PathBuf;

use anyhow::Result;
use callfx_common::config::{ConfigStore, DEFAULT_CONFIG_PATH};
use callfx_common::ParticipantId;
use callfx_media::encoder::DEFAULT_MAX_DIMENSION;
use clap::{Parser, Subcommand};

use crate::config_cmd::ConfigAction;

#[derive(Parser, Debug)]
#[command(name = "callfx")]
#[command(about = "callfx CLI tools")]
struct Args {
    /// Effects config document
    #[arg(long, global = true, env = "CALLFX_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh participant id
    Id,

    /// Inspect or change the effects config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Re-encode an image as JPEG within a byte budget
    Shrink {
        input: PathBuf,
        output: PathBuf,

        /// Byte budget for the output
        #[arg(long)]
        max_bytes: usize,

        /// Pre-scale target for the larger side
        #[arg(long, default_value_t = DEFAULT_MAX_DIMENSION)]
        max_dim: u32,
    },

    /// Run the effects pipeline over a still image
    Effects {
        input: PathBuf,
        output: PathBuf,

        /// Enable every effect regardless of the config
        #[arg(long)]
        all: bool,
    },

    /// Run a call between two local peers, sending effected test video
    DemoCall,

    /// Join calls through a signaling relay
    Call {
        /// Relay WebSocket URL
        #[arg(long, env = "CALLFX_RELAY_URL")]
        relay: String,

        /// Peer to call right away
        #[arg(long)]
        peer: Option<String>,

        /// Our participant id (random when omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    callfx_common::init_tracing_with_default("warn");

    let args = Args::parse();

    match args.command {
        Command::Id => {
            println!("{}", ParticipantId::generate());
        }
        Command::Config { action } => {
            let store = ConfigStore::new(&args.config);
            print!("{}", config_cmd::run(&store, action)?);
        }
        Command::Shrink {
            input,
            output,
            max_bytes,
            max_dim,
        } => {
            println!("{}", media::shrink(&input, &output, max_bytes, max_dim)?);
        }
        Command::Effects { input, output, all } => {
            let config = ConfigStore::new(&args.config).load();
            let summary = runtime()?.block_on(media::apply_effects(&config, &input, &output, all))?;
            println!("{}", summary);
        }
        Command::DemoCall => {
            runtime()?.block_on(call::demo_call(ConfigStore::new(&args.config)))?;
        }
        Command::Call { relay, peer, id } => {
            let store = ConfigStore::new(&args.config);
            runtime()?.block_on(call::relay_call(store, &relay, id, peer))?;
        }
        Command::Version => {
            println!("callfx {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_shrink_arguments() {
        let args = Args::try_parse_from([
            "callfx",
            "shrink",
            "in.png",
            "out.jpg",
            "--max-bytes",
            "200000",
        ])
        .unwrap();
        match args.command {
            Command::Shrink {
                max_bytes, max_dim, ..
            } => {
                assert_eq!(max_bytes, 200_000);
                assert_eq!(max_dim, DEFAULT_MAX_DIMENSION);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_config_flag_is_global() {
        let args =
            Args::try_parse_from(["callfx", "config", "show", "--config", "/tmp/x.json"]).unwrap();
        assert_eq!(args.config, PathBuf::from("/tmp/x.json"));
    }

    #[test]
    fn test_unknown_effect_is_rejected() {
        assert!(Args::try_parse_from(["callfx", "config", "toggle", "sepia"]).is_err());
    }
}
