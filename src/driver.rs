//! Debugger driver: owns the GDB subprocess and the request/response
//! conversation over its pipes.
//!
//! GDB's stream is only loosely framed. Replies end with a `(gdb)` prompt,
//! asynchronous records interleave with command acknowledgments, and an
//! interrupt produces two records. `fetch` absorbs that: it accumulates
//! pipe output until the reply is complete, preserves anything past the
//! terminator for the next call, and recognizes the termination signatures
//! that mean no further reply is coming.

use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::prctl;
use nix::sys::signal::Signal;
use tracing::{debug, warn};

use crate::error::ProfilerError;

/// GDB's idle prompt, the framing marker between replies.
pub const PROMPT: &str = "(gdb)";

/// Anchor of the asynchronous stop record that follows an interrupt.
pub const STOPPED_ANCHOR: &str = "*stopped,";

/// Ceiling for one accumulated response.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Tail preserved when a response overflows the ceiling. The tokens that
/// matter (prompt, stack block, exit markers) sit near the end.
const TAIL_KEEP: usize = 32 * 1024;

/// Sleep between reads when the pipe has nothing for us, so the sender is
/// not starved of CPU.
const RETRY_SLEEP: Duration = Duration::from_micros(200);

/// Retry ceiling for one fetch. At 200us per idle attempt this bounds a
/// wedged debugger to roughly three minutes.
const MAX_READ_ATTEMPTS: u32 = 900_000;

/// The debugger subprocess and the two pipes to it.
pub struct GdbDriver {
    child: Child,
    stdin: ChildStdin,
    output: OwnedFd,
    pending: String,
    target_exited: bool,
    detach_in_progress: bool,
    log: Option<File>,
}

impl GdbDriver {
    /// Spawn the debugger with stdout and stderr merged onto one
    /// nonblocking pipe. The kernel delivers SIGTERM to the child if the
    /// profiler dies first, so no debugger outlives its session.
    pub fn spawn(
        program: &str,
        args: &[String],
        log_path: Option<&Path>,
    ) -> Result<Self, ProfilerError> {
        let (read_end, write_end) = nix::unistd::pipe().map_err(io_error)?;
        let stderr_end = write_end.try_clone()?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(stderr_end));
        unsafe {
            command.pre_exec(|| {
                prctl::set_pdeathsig(Signal::SIGTERM).map_err(std::io::Error::from)
            });
        }
        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            ProfilerError::DriverIo(std::io::Error::new(
                std::io::ErrorKind::Other,
                "debugger stdin was not captured",
            ))
        })?;

        fcntl(read_end.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(io_error)?;

        let log = match log_path {
            Some(path) => Some(File::create(path)?),
            None => None,
        };

        Ok(Self {
            child,
            stdin,
            output: read_end,
            pending: String::new(),
            target_exited: false,
            detach_in_progress: false,
            log,
        })
    }

    /// OS PID of the debugger child.
    pub fn child_id(&self) -> u32 {
        self.child.id()
    }

    /// Whether a termination signature has been observed. Monotone.
    pub fn target_exited(&self) -> bool {
        self.target_exited
    }

    /// While set, exit markers in the stream are not treated as target
    /// death; detaching produces the same records.
    pub fn set_detach_in_progress(&mut self, value: bool) {
        self.detach_in_progress = value;
    }

    /// Write one newline-terminated command. Writes are synchronous and
    /// complete before this returns.
    pub fn send(&mut self, command: &str) -> Result<(), ProfilerError> {
        self.log_entry("Sending command to GDB", command);
        debug!(command, "gdb command");
        self.stdin.write_all(command.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        Ok(())
    }

    /// Accumulate pipe output until the reply is complete: the `(gdb)`
    /// prompt has been seen and, when `until` supplies an anchor, the
    /// anchor and the prompt that follows it. Bytes past the terminator
    /// stay queued for the next fetch.
    ///
    /// Returns early with whatever accumulated when the stream carries a
    /// termination marker (latching `target_exited`) or hits end of file.
    /// Errs with `DriverTimeout` at the retry ceiling, carrying the
    /// partial response.
    pub fn fetch(&mut self, until: Option<&str>) -> Result<String, ProfilerError> {
        let mut response = std::mem::take(&mut self.pending);

        if let Some(cut) = reply_end(&response, until) {
            self.pending = response.split_off(cut);
            return Ok(response);
        }

        let mut scratch = [0u8; 4096];
        let mut attempts: u32 = 0;

        while attempts < MAX_READ_ATTEMPTS {
            attempts += 1;
            match nix::unistd::read(self.output.as_raw_fd(), &mut scratch) {
                Ok(0) => {
                    debug!("gdb output pipe closed");
                    return Ok(response);
                }
                Ok(count) => {
                    response.push_str(&String::from_utf8_lossy(&scratch[..count]));
                    if response.len() > READ_BUF_SIZE {
                        trim_to_tail(&mut response);
                    }
                    if let Some(cut) = reply_end(&response, until) {
                        self.pending = response.split_off(cut);
                        return Ok(response);
                    }
                    if !self.detach_in_progress && stream_shows_exit(&response) {
                        self.target_exited = true;
                        return Ok(response);
                    }
                }
                Err(Errno::EAGAIN) => thread::sleep(RETRY_SLEEP),
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(io_error(errno)),
            }
        }

        warn!(attempts, "gdb reply had no terminator before retry ceiling");
        Err(ProfilerError::DriverTimeout {
            attempts,
            partial: response,
        })
    }

    /// Fetch and return a reply, treating a timeout as an idle debugger
    /// and recovering the partial text.
    fn fetch_lenient(&mut self, until: Option<&str>) -> Result<String, ProfilerError> {
        match self.fetch(until) {
            Ok(response) => Ok(response),
            Err(ProfilerError::DriverTimeout { attempts, partial }) => {
                warn!(attempts, "assuming idle debugger after fetch timeout");
                Ok(partial)
            }
            Err(other) => Err(other),
        }
    }

    /// Fetch the next prompt-framed reply and return it.
    pub fn request(&mut self) -> Result<String, ProfilerError> {
        let response = self.fetch_lenient(None)?;
        self.log_entry("Response", &response);
        self.probe_exit_inner(&response);
        Ok(response)
    }

    /// Fetch and discard a reply we do not need.
    pub fn skip(&mut self) -> Result<(), ProfilerError> {
        let response = self.fetch_lenient(None)?;
        if !response.is_empty() {
            self.log_entry("Skipping response", &response);
        }
        self.probe_exit_inner(&response);
        Ok(())
    }

    /// Wait for the `*stopped,` record an interrupt produces. Interrupts
    /// reply twice (the acknowledgment, then the stop record), so plain
    /// prompt framing is not enough here.
    pub fn wait_for_stop(&mut self) -> Result<(), ProfilerError> {
        let response = self.fetch_lenient(Some(STOPPED_ANCHOR))?;
        if !response.is_empty() {
            self.log_entry("Interrupt response", &response);
        }
        self.probe_exit_inner(&response);
        Ok(())
    }

    /// Scan a response for target-termination signatures and latch
    /// `target_exited`. The sampling loop stops at the next boundary once
    /// the latch is set.
    pub fn probe_exit(&mut self, response: &str) {
        self.probe_exit_inner(response);
    }

    fn probe_exit_inner(&mut self, response: &str) {
        if self.target_exited || self.detach_in_progress || response.is_empty() {
            return;
        }
        let exited = response.contains("exited-normally")
            || response.contains("\"exited\"")
            || stream_shows_exit(response)
            || (response.contains("stopped")
                && response.contains("signal-received")
                && !response.contains("SIGINT"));
        if exited {
            self.target_exited = true;
            self.log_entry("Detected target exit", response);
            debug!("target exit signature observed");
        }
    }

    fn log_entry(&mut self, header: &str, body: &str) {
        if let Some(log) = self.log.as_mut() {
            let _ = writeln!(log, "{header}:\n{body}\n\n");
            let _ = log.flush();
        }
    }
}

impl Drop for GdbDriver {
    fn drop(&mut self) {
        // PDEATHSIG covers the crash paths; reap deliberately on this one.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn io_error(errno: Errno) -> ProfilerError {
    ProfilerError::DriverIo(errno.into())
}

/// Where a complete reply ends, if it is complete.
///
/// Without an anchor the reply ends at the first prompt. With an anchor,
/// the anchor must appear and the reply runs through the prompt after it;
/// if the stream shows the anchor but no prompt followed yet (the stop
/// record is still streaming), the reply is not complete. A prompt that
/// arrived before the anchor alone never completes an anchored fetch.
fn reply_end(response: &str, until: Option<&str>) -> Option<usize> {
    match until {
        None => response.find(PROMPT).map(|at| at + PROMPT.len()),
        Some(anchor) => {
            let anchor_end = response.find(anchor)? + anchor.len();
            response[anchor_end..]
                .find(PROMPT)
                .map(|at| anchor_end + at + PROMPT.len())
        }
    }
}

/// Markers that mean the target is gone and no further reply will come,
/// so a fetch must stop waiting for its terminator.
fn stream_shows_exit(response: &str) -> bool {
    (response.contains("[Inferior") && response.contains("exited"))
        || response.contains("thread-group-exited")
        || response.contains("Program terminated with signal SIGKILL, Killed.")
        || response.contains("Program terminated with signal SIGTERM, Terminated.")
        || response.contains("Program received signal SIGSEGV, Segmentation fault.")
        || response.contains("The program is not being run.")
}

/// Keep only the last `TAIL_KEEP` bytes. Responses longer than the scratch
/// ceiling lose their head; the interesting tokens appear near the end.
fn trim_to_tail(response: &mut String) {
    if response.len() <= TAIL_KEEP {
        return;
    }
    let mut cut = response.len() - TAIL_KEEP;
    while !response.is_char_boundary(cut) {
        cut -= 1;
    }
    response.drain(..cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_frames_a_plain_reply() {
        let cut = reply_end("^done\n(gdb) \nrest", None).unwrap();
        assert_eq!(&"^done\n(gdb) \nrest"[..cut], "^done\n(gdb)");
    }

    #[test]
    fn plain_reply_without_prompt_is_incomplete() {
        assert!(reply_end("^done\n", None).is_none());
    }

    #[test]
    fn anchored_reply_runs_through_the_prompt_after_the_anchor() {
        let stream = "^done\n(gdb) \n*stopped,reason=\"signal-received\"\n(gdb) \nextra";
        let cut = reply_end(stream, Some(STOPPED_ANCHOR)).unwrap();
        assert!(stream[..cut].ends_with(PROMPT));
        assert!(stream[..cut].contains(STOPPED_ANCHOR));
        assert_eq!(&stream[cut..], " \nextra");
    }

    #[test]
    fn anchored_reply_is_incomplete_until_the_stop_record_is_framed() {
        // acknowledgment prompt alone must not finish an anchored fetch
        assert!(reply_end("^done\n(gdb) \n", Some(STOPPED_ANCHOR)).is_none());
        // anchor seen, but its closing prompt still streaming
        assert!(reply_end("^done\n(gdb) \n*stopped,reas", Some(STOPPED_ANCHOR)).is_none());
    }

    #[test]
    fn exit_markers_are_recognized() {
        assert!(stream_shows_exit("=thread-group-exited,id=\"i1\"\n"));
        assert!(stream_shows_exit("[Inferior 1 (process 77) exited normally]\n"));
        assert!(stream_shows_exit(
            "Program terminated with signal SIGKILL, Killed.\n"
        ));
        assert!(stream_shows_exit("The program is not being run.\n"));
        assert!(!stream_shows_exit("^running\n(gdb) \n"));
        assert!(!stream_shows_exit("[Inferior 1 (process 77)]\n"));
    }

    #[test]
    fn tail_trim_keeps_the_end() {
        let mut text = "a".repeat(READ_BUF_SIZE) + "terminator";
        trim_to_tail(&mut text);
        assert_eq!(text.len(), TAIL_KEEP);
        assert!(text.ends_with("terminator"));
    }

    #[test]
    fn tail_trim_respects_char_boundaries() {
        let mut text = "é".repeat(TAIL_KEEP);
        trim_to_tail(&mut text);
        assert!(text.len() <= TAIL_KEEP);
        assert!(text.chars().all(|c| c == 'é'));
    }
}
