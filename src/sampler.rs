//! Sampling controller: owns wall-clock pacing and the
//! interrupt -> collect -> resume cycle.
//!
//! The target must spend nearly all wall-clock time running. Each sample
//! is a short stop window, and every branch of a sample falls through to
//! a continue step, so no error path leaves the target stopped.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::aggregator::Aggregator;
use crate::backtrace::{self, FrameInterner, ParsedStack};
use crate::cli::SamplingMethod;
use crate::driver::GdbDriver;
use crate::error::ProfilerError;
use crate::report;

/// Where a spawned target's output goes in MI mode.
pub const SPAWN_OUTPUT_FILE: &str = "wcOut.txt";
/// Where a spawned target's output goes in console mode.
pub const CONSOLE_SPAWN_OUTPUT_FILE: &str = "wcprof_program_output.txt";
/// Append-only transcript of every command sent and response fetched.
pub const GDB_LOG_FILE: &str = "wcGDBLog.txt";

/// Progress heartbeat interval while sampling.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// Settle time after starting or resuming the target, before the next
/// exchange with the debugger.
const TARGET_SETTLE: Duration = Duration::from_millis(100);

/// How the target comes to exist.
#[derive(Debug, Clone)]
pub enum LaunchMode {
    /// Start the target under the debugger.
    Spawn { argv: Vec<String> },
    /// Attach to an already-running PID.
    Attach { pid: i32, executable: String },
}

/// Configuration for one profiling session.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Microseconds between samples.
    pub delay_us: u64,
    pub method: SamplingMethod,
    /// Seconds to keep sampling; zero or negative means until target exit.
    pub profile_secs: i64,
    pub launch: LaunchMode,
}

impl SamplerConfig {
    fn executable(&self) -> &str {
        match &self.launch {
            LaunchMode::Spawn { argv } => &argv[0],
            LaunchMode::Attach { executable, .. } => executable,
        }
    }

    fn spawn_mode(&self) -> bool {
        matches!(self.launch, LaunchMode::Spawn { .. })
    }
}

/// Run one profiling session end to end: spawn the debugger, start or
/// attach the target, sample until it exits or the deadline or a
/// termination signal arrives, then report and quit.
pub fn run(config: SamplerConfig) -> Result<()> {
    if let SamplingMethod::RoundRobin(_) = config.method {
        bail!("round robin sampling is not implemented");
    }
    if let LaunchMode::Spawn { argv } = &config.launch {
        if argv.is_empty() {
            bail!("no target command given");
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("failed to install SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("failed to install SIGTERM handler")?;

    let mi = matches!(config.method, SamplingMethod::Default);
    let executable = config.executable().to_string();

    let gdb_args = if mi {
        vec![
            "-nx".to_string(),
            "--interpreter=mi".to_string(),
            executable.clone(),
        ]
    } else {
        vec!["-nx".to_string(), executable.clone()]
    };

    let mut driver = GdbDriver::spawn("gdb", &gdb_args, Some(Path::new(GDB_LOG_FILE)))
        .context("failed to spawn gdb")?;
    println!("Forked GDB child on PID={}", driver.child_id());
    println!("Logging GDB commands and responses to {GDB_LOG_FILE}");

    let banner = driver.request()?;
    if banner.contains("No such file or directory.") {
        return Err(
            ProfilerError::LaunchFailed(format!("GDB failed to start program '{executable}'"))
                .into(),
        );
    }

    // keep the debugger alive across target-side pipe breakage
    driver.send("handle SIGPIPE nostop noprint pass")?;
    driver.skip()?;

    match &config.launch {
        LaunchMode::Spawn { argv } => start_target(&mut driver, argv, mi)?,
        LaunchMode::Attach { pid, .. } => attach_target(&mut driver, *pid, mi)?,
    }

    let target_pid = match &config.launch {
        LaunchMode::Spawn { .. } => query_target_pid(&executable)?,
        LaunchMode::Attach { .. } => inferior_pid(&mut driver, mi)?,
    };
    println!("PID of debugged process = {target_pid}");
    println!("Sampling stack while program runs...");

    let samples_per_sec = 1_000_000.0 / config.delay_us as f64;
    println!(
        "Sampling {samples_per_sec:.2} times per second, for {} usec between samples",
        config.delay_us
    );
    let deadline = if config.profile_secs > 0 {
        println!(
            "Will detach automatically after {} seconds",
            config.profile_secs
        );
        Some(Instant::now() + Duration::from_secs(config.profile_secs as u64))
    } else {
        None
    };

    let mut aggregator = Aggregator::new();
    let mut interner = FrameInterner::new();
    let start = Instant::now();
    let mut last_progress = Instant::now();
    let mut sampling_cost = Duration::ZERO;

    while !driver.target_exited() && !shutdown.load(Ordering::Relaxed) {
        if deadline.is_some_and(|at| Instant::now() >= at) {
            break;
        }

        thread::sleep(Duration::from_micros(config.delay_us));

        let window = Instant::now();
        match config.method {
            SamplingMethod::Default => {
                sample_structured(&mut driver, config.spawn_mode(), target_pid, &mut aggregator)?
            }
            SamplingMethod::SingleThread => {
                sample_console(&mut driver, false, &mut interner, &mut aggregator)?
            }
            SamplingMethod::AllThreads => {
                sample_console(&mut driver, true, &mut interner, &mut aggregator)?
            }
            SamplingMethod::RoundRobin(_) => bail!("round robin sampling is not implemented"),
        }
        sampling_cost += window.elapsed();

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            println!(
                "Collected {} stack samples in {} seconds",
                aggregator.total_samples(),
                start.elapsed().as_secs()
            );
            last_progress = Instant::now();
        }
    }

    if driver.target_exited() {
        println!("Program exited");
    } else {
        stop_target(&mut driver, config.spawn_mode(), target_pid, mi)?;
    }

    println!("{} stack samples taken", aggregator.total_samples());
    println!("{} unique stacks sampled", aggregator.unique_stacks());
    if aggregator.total_samples() > 0 {
        let average_ms =
            sampling_cost.as_secs_f64() * 1000.0 / aggregator.total_samples() as f64;
        println!("Average stack sampling duration: {average_ms:.3} ms");
    }

    // the report echoes source lines through the still-running debugger
    report::print_report(&mut driver, &aggregator, mi);

    quit(&mut driver, mi);
    Ok(())
}

/// Start the target under the debugger with its output redirected to a
/// well-known file.
fn start_target(driver: &mut GdbDriver, argv: &[String], mi: bool) -> Result<()> {
    let args = shell_join(&argv[1..]);
    let command = if mi {
        format!("run {args} > {SPAWN_OUTPUT_FILE}")
    } else {
        format!("run {args} > {CONSOLE_SPAWN_OUTPUT_FILE} &")
    };
    let output = if mi {
        SPAWN_OUTPUT_FILE
    } else {
        CONSOLE_SPAWN_OUTPUT_FILE
    };
    println!("\nStarting program with '{command}', redirecting program output to {output}");
    driver.send(&command)?;
    thread::sleep(TARGET_SETTLE);
    driver.skip()?;
    Ok(())
}

/// Attach the debugger to a running PID. Refusals (no such process, not
/// permitted) are user errors, reported and exited clean.
fn attach_target(driver: &mut GdbDriver, pid: i32, mi: bool) -> Result<()> {
    println!("\nAttaching to PID {pid}");
    let response = if mi {
        driver.send("-gdb-set target-async 1")?;
        driver.skip()?;
        driver.send(&format!("-target-attach {pid}"))?;
        driver.request()?
    } else {
        driver.send(&format!("attach {pid} &"))?;
        driver.request()?
    };

    if response.contains("ptrace: No such process.") {
        return Err(
            ProfilerError::TargetUnreachable(format!("GDB could not find process {pid}")).into(),
        );
    }
    if response.contains("ptrace: Operation not permitted.") {
        return Err(ProfilerError::TargetUnreachable(format!(
            "GDB could not attach to process {pid} (maybe you need to be root?)"
        ))
        .into());
    }

    if mi {
        println!("Resuming attached program with '-exec-continue'");
        driver.send("-exec-continue")?;
        thread::sleep(TARGET_SETTLE);
        driver.skip()?;
    }
    Ok(())
}

/// The PID the debugger launched, asked of the OS. With several live
/// candidates pidof lists newest first, which is the one our child spawned.
fn query_target_pid(executable: &str) -> Result<i32> {
    let name = Path::new(executable)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable.to_string());
    let output = Command::new("pidof")
        .arg(&name)
        .output()
        .context("failed to run pidof to find the target PID")?;
    let text = String::from_utf8_lossy(&output.stdout);
    text.split_whitespace()
        .next()
        .and_then(|token| token.parse().ok())
        .context("failed to read PID of debugged program")
}

/// The true process PID of an attach target; the PID given on the command
/// line may name a thread. Interrupt, read `info inferior`, resume.
fn inferior_pid(driver: &mut GdbDriver, mi: bool) -> Result<i32> {
    let pid = if mi {
        driver.send("-exec-interrupt")?;
        driver.wait_for_stop()?;
        driver.send("info inferior")?;
        let response = driver.request()?;
        let pid = parse_inferior_pid(&response);
        driver.send("-exec-continue")?;
        driver.skip()?;
        pid
    } else {
        driver.send("interrupt")?;
        driver.send("info inferior")?;
        driver.send("c &")?;
        driver.skip()?; // interrupt acknowledgment
        let response = driver.request()?;
        let pid = parse_inferior_pid(&response);
        driver.skip()?; // continue acknowledgment
        pid
    };
    pid.context("cannot read the target PID from 'info inferior'")
}

/// Extract the PID from the `  process <PID>` line of an `info inferior`
/// reply.
fn parse_inferior_pid(response: &str) -> Option<i32> {
    let at = response.find("  process ")?;
    response[at + "  process ".len()..]
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// One MI sample: interrupt, wait for the stop record, list frames,
/// record, continue.
fn sample_structured(
    driver: &mut GdbDriver,
    spawn_mode: bool,
    target_pid: i32,
    aggregator: &mut Aggregator,
) -> Result<()> {
    if spawn_mode {
        // The target shares the debugger's stdio, so -exec-interrupt
        // cannot reach it; signal the process directly.
        if let Err(err) = signal::kill(Pid::from_raw(target_pid), Signal::SIGINT) {
            debug!(%err, "SIGINT to target failed");
        }
    } else {
        driver.send("-exec-interrupt")?;
    }

    driver.wait_for_stop()?;

    if !driver.target_exited() {
        driver.send("-stack-list-frames")?;
        let response = driver.request()?;
        if !driver.target_exited() {
            match backtrace::parse_stack_list(&response) {
                Ok(frames) => aggregator.record(&ParsedStack {
                    thread: "main".to_string(),
                    frames,
                }),
                Err(err) => debug!(%err, "dropping unparsable sample"),
            }
        }
    }

    if !driver.target_exited() {
        driver.send("-exec-continue")?;
        driver.skip()?;
    }
    Ok(())
}

/// One console sample: pipeline interrupt, backtrace, continue, then
/// consume the three prompt-framed replies.
fn sample_console(
    driver: &mut GdbDriver,
    all_threads: bool,
    interner: &mut FrameInterner,
    aggregator: &mut Aggregator,
) -> Result<()> {
    driver.send("interrupt")?;
    if all_threads {
        driver.send(
            "thread apply all backtrace -frame-arguments none -frame-info location-and-address",
        )?;
    } else {
        driver.send("backtrace -frame-arguments none -frame-info location-and-address")?;
    }
    driver.send("c &")?;

    driver.skip()?; // interrupt acknowledgment
    let response = driver.request()?; // backtrace payload
    if !driver.target_exited() {
        if all_threads {
            for stack in backtrace::parse_all_threads(interner, &response) {
                aggregator.record(&stack);
            }
        } else {
            let lines: Vec<&str> = response.lines().collect();
            if let Some(stack) = backtrace::parse_console_backtrace(interner, "main", &lines) {
                aggregator.record(&stack);
            }
        }
    }
    driver.skip()?; // continue acknowledgment
    Ok(())
}

/// Stop sampling a still-running target. An attach target is interrupted
/// and detached; a spawned one is ours to take down.
fn stop_target(driver: &mut GdbDriver, spawn_mode: bool, target_pid: i32, mi: bool) -> Result<()> {
    if spawn_mode && !mi {
        println!("Stopping program");
        let _ = signal::kill(Pid::from_raw(target_pid), Signal::SIGKILL);
        return Ok(());
    }

    println!("Detaching from program");
    if spawn_mode {
        let _ = signal::kill(Pid::from_raw(target_pid), Signal::SIGINT);
        driver.wait_for_stop()?;
    } else if mi {
        driver.send("-exec-interrupt")?;
        driver.wait_for_stop()?;
    } else {
        driver.send("interrupt")?;
        driver.skip()?;
    }

    driver.set_detach_in_progress(true);
    driver.send(if mi { "-target-detach" } else { "detach" })?;
    driver.skip()?;
    driver.set_detach_in_progress(false);
    Ok(())
}

/// Quit the debugger. Failures are ignored; the child is reaped on drop.
fn quit(driver: &mut GdbDriver, mi: bool) {
    info!("quitting gdb");
    if driver.send(if mi { "-gdb-exit" } else { "quit" }).is_ok() {
        let _ = driver.skip();
    }
}

/// Quote each argument so the debugger's `run` line survives spaces.
fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| format!("\"{arg}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inferior_pid_parses_the_process_line() {
        let reply = "\
~\"  Num  Description       Connection           Executable        \\n\"
~\"* 1    process 41714     1 (native)           /usr/bin/spin     \\n\"
(gdb) ";
        assert_eq!(parse_inferior_pid(reply), Some(41714));
    }

    #[test]
    fn inferior_pid_requires_the_process_marker() {
        assert_eq!(parse_inferior_pid("No inferiors.\n(gdb) "), None);
    }

    #[test]
    fn shell_join_quotes_every_argument() {
        let args = vec!["--n".to_string(), "two words".to_string()];
        assert_eq!(shell_join(&args), "\"--n\" \"two words\"");
    }

    #[test]
    fn empty_argument_list_joins_to_nothing() {
        assert_eq!(shell_join(&[]), "");
    }
}
