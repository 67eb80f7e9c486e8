//! CLI argument parsing for reloj

use std::str::FromStr;

use clap::{Parser, Subcommand};

/// How stacks are collected on each sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMethod {
    /// GDB/MI structured frames, current thread only.
    Default,
    /// Console backtrace, current thread only.
    SingleThread,
    /// Console backtrace across every thread.
    AllThreads,
    /// Reserved: up to N threads per sample. Parsed but not supported.
    RoundRobin(u32),
}

impl FromStr for SamplingMethod {
    type Err = String;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "default" => Ok(Self::Default),
            "single_thread" => Ok(Self::SingleThread),
            "all_threads" => Ok(Self::AllThreads),
            _ => match token.strip_prefix("round_robin_") {
                Some(count) => {
                    let count: u32 = count
                        .parse()
                        .map_err(|_| format!("invalid round robin thread count in '{token}'"))?;
                    if !(1..=10_000).contains(&count) {
                        return Err(
                            "round robin sampling requires a thread count of 1 to 10000".into()
                        );
                    }
                    Ok(Self::RoundRobin(count))
                }
                None => Err(format!(
                    "invalid sampling method '{token}' \
                     (expected default, single_thread, all_threads, or round_robin_N)"
                )),
            },
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "reloj")]
#[command(version)]
#[command(
    about = "Wall-clock sampling profiler that drives GDB",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch a program under the debugger and profile it
    Run {
        /// Samples per second
        #[arg(short = 'r', long, default_value_t = 100.0)]
        rate: f64,

        /// Microseconds between samples (overrides --rate)
        #[arg(long, value_name = "US")]
        delay_us: Option<u64>,

        /// Sampling method: default, single_thread, all_threads, round_robin_N
        #[arg(short = 'm', long, default_value = "default")]
        method: SamplingMethod,

        /// Seconds to profile for (0 or less: until the program exits)
        #[arg(short = 't', long, default_value_t = 0, allow_hyphen_values = true)]
        time: i64,

        /// Program to launch, followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Attach to a running process by PID and profile it
    Attach {
        /// Samples per second
        #[arg(short = 'r', long, default_value_t = 100.0)]
        rate: f64,

        /// Microseconds between samples (overrides --rate)
        #[arg(long, value_name = "US")]
        delay_us: Option<u64>,

        /// Sampling method: default, single_thread, all_threads, round_robin_N
        #[arg(short = 'm', long, default_value = "default")]
        method: SamplingMethod,

        /// Seconds before detaching (0 or less: stay attached until exit)
        #[arg(short = 't', long, default_value_t = -1, allow_hyphen_values = true)]
        time: i64,

        /// PID of the running process
        pid: i32,

        /// Path to its executable, for symbols
        executable: String,
    },
}

/// Microseconds between samples from the rate/delay flags; an explicit
/// `--delay-us` wins over the rate.
pub fn sample_delay_us(rate: f64, delay_us: Option<u64>) -> Result<u64, String> {
    if let Some(us) = delay_us {
        if us == 0 {
            return Err("--delay-us must be positive".into());
        }
        return Ok(us);
    }
    if !rate.is_finite() || rate <= 0.0 {
        return Err("--rate must be a positive number".into());
    }
    Ok(((1_000_000.0 / rate).round() as u64).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_tokens_parse() {
        assert_eq!(
            "default".parse::<SamplingMethod>().unwrap(),
            SamplingMethod::Default
        );
        assert_eq!(
            "single_thread".parse::<SamplingMethod>().unwrap(),
            SamplingMethod::SingleThread
        );
        assert_eq!(
            "all_threads".parse::<SamplingMethod>().unwrap(),
            SamplingMethod::AllThreads
        );
        assert_eq!(
            "round_robin_8".parse::<SamplingMethod>().unwrap(),
            SamplingMethod::RoundRobin(8)
        );
    }

    #[test]
    fn round_robin_count_is_bounded() {
        assert!("round_robin_0".parse::<SamplingMethod>().is_err());
        assert!("round_robin_10001".parse::<SamplingMethod>().is_err());
        assert!("round_robin_x".parse::<SamplingMethod>().is_err());
        assert!("round_robin_10000".parse::<SamplingMethod>().is_ok());
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!("fastest".parse::<SamplingMethod>().is_err());
    }

    #[test]
    fn delay_comes_from_rate_unless_overridden() {
        assert_eq!(sample_delay_us(100.0, None).unwrap(), 10_000);
        assert_eq!(sample_delay_us(0.5, None).unwrap(), 2_000_000);
        assert_eq!(sample_delay_us(100.0, Some(250)).unwrap(), 250);
    }

    #[test]
    fn bad_rates_are_rejected() {
        assert!(sample_delay_us(0.0, None).is_err());
        assert!(sample_delay_us(-5.0, None).is_err());
        assert!(sample_delay_us(f64::NAN, None).is_err());
        assert!(sample_delay_us(100.0, Some(0)).is_err());
    }

    #[test]
    fn very_high_rates_clamp_to_one_microsecond() {
        assert_eq!(sample_delay_us(10_000_000.0, None).unwrap(), 1);
    }
}
