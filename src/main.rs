use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use reloj::cli::{self, Cli, Commands};
use reloj::error::ProfilerError;
use reloj::sampler::{self, LaunchMode, SamplerConfig};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    let config = match args.command {
        Commands::Run {
            rate,
            delay_us,
            method,
            time,
            command,
        } => SamplerConfig {
            delay_us: cli::sample_delay_us(rate, delay_us).map_err(anyhow::Error::msg)?,
            method,
            profile_secs: time,
            launch: LaunchMode::Spawn { argv: command },
        },
        Commands::Attach {
            rate,
            delay_us,
            method,
            time,
            pid,
            executable,
        } => SamplerConfig {
            delay_us: cli::sample_delay_us(rate, delay_us).map_err(anyhow::Error::msg)?,
            method,
            profile_secs: time,
            launch: LaunchMode::Attach { pid, executable },
        },
    };

    match sampler::run(config) {
        Ok(()) => Ok(()),
        Err(err) => match err.downcast_ref::<ProfilerError>() {
            // operator input problem, not an internal fault
            Some(inner) if inner.is_user_error() => {
                println!("{inner}");
                Ok(())
            }
            _ => Err(err),
        },
    }
}
