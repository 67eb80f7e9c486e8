//! Ranked plain-text report: functions, shared stack roots, full stacks.
//!
//! Each stack's top frame is printed with its source line echoed through
//! the debugger's `list` command when one can be fetched; failure to fetch
//! is silent and the frame is printed anyway.

use crate::aggregator::{Aggregator, Stack, DEFAULT_FUNCTION_FLOOR, MAX_ROOT_DEPTH};
use crate::driver::GdbDriver;

/// Print the final report. `mi` selects the `list` reply dialect for the
/// source echo.
pub fn print_report(driver: &mut GdbDriver, aggregator: &Aggregator, mi: bool) {
    let total = aggregator.total_samples();

    println!("\n\n\nReport:\n");

    println!("\n\nFunctions with more than one sample:\n");
    for function in aggregator.ranked_functions(DEFAULT_FUNCTION_FLOOR) {
        println!(
            "{:7.3}% ===================================== ({} samples)\n         {}\n\n",
            percent(function.samples, total),
            function.samples,
            function.name
        );
    }

    for depth in 1..MAX_ROOT_DEPTH {
        let roots = aggregator.ranked_roots(depth);
        if roots.is_empty() {
            continue;
        }
        println!("\n\nPartial stacks of depth [{depth}] with more than one sample:\n");
        for stack in roots {
            print_stack(driver, stack, total, mi);
        }
    }

    println!("\n\nFull stacks with at least one sample:\n");
    for stack in aggregator.ranked_stacks() {
        print_stack(driver, stack, total, mi);
    }
}

fn print_stack(driver: &mut GdbDriver, stack: &Stack, total: u64, mi: bool) {
    let Some(top) = stack.frames.first() else {
        return;
    };

    println!(
        "{:7.3}% ===================================== ({} samples)",
        percent(stack.samples, total),
        stack.samples
    );
    if stack.thread != "main" {
        println!("       [{}]", stack.thread);
    }
    println!("       {:3}: {}   (at {}:{})", 1, top.function, top.file, top.line);

    if top.line > 0 {
        if let Some(text) = fetch_source_line(driver, &top.file, top.line, mi) {
            println!("            {}:|   {}", top.line, text);
        }
    }

    for (index, frame) in stack.frames.iter().enumerate().skip(1) {
        println!(
            "       {:3}: {}   (at {}:{})",
            index + 1,
            frame.function,
            frame.file,
            frame.line
        );
    }
    println!("\n");
}

fn percent(samples: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * samples as f64 / total as f64
    }
}

/// Ask the debugger to echo one source line.
fn fetch_source_line(driver: &mut GdbDriver, file: &str, line: i32, mi: bool) -> Option<String> {
    if file.is_empty() {
        return None;
    }
    driver.send(&format!("list {file}:{line},{line}")).ok()?;
    let response = driver.request().ok()?;
    extract_source_line(&response, file, line, mi)
}

/// Pull the annotated source text out of a `list` reply.
///
/// MI wraps console output in `~"..."` stream records, so the line arrives
/// as `~"LINE\t<text>\n"`; console GDB prints `LINE\t<text>` directly. A
/// reply that echoes the file name back after the marker is a not-found
/// error, not source.
pub fn extract_source_line(response: &str, file: &str, line: i32, mi: bool) -> Option<String> {
    if mi {
        let marker = format!("~\"{line}\\t");
        let at = response.find(&marker)?;
        let rest = &response[at + marker.len()..];
        if rest.contains(file) {
            return None;
        }
        let rest = rest.trim_start_matches(' ');
        let text = match rest.find("\\n") {
            Some(end) => &rest[..end],
            None => rest,
        };
        Some(text.to_string())
    } else {
        let marker = format!("{line}\t");
        response
            .lines()
            .find_map(|l| l.strip_prefix(marker.as_str()))
            .map(|text| text.trim_start().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mi_list_reply_yields_the_annotated_line() {
        let reply = "&\"list main.c:12,12\\n\"\n~\"12\\t    counter += 1;\\n\"\n^done\n(gdb) ";
        assert_eq!(
            extract_source_line(reply, "main.c", 12, true).as_deref(),
            Some("counter += 1;")
        );
    }

    #[test]
    fn mi_not_found_reply_is_silent() {
        // the echoed file name after the marker means a lookup error
        let reply = "~\"12\\tin main.c\\n\"\n^done\n(gdb) ";
        assert_eq!(extract_source_line(reply, "main.c", 12, true), None);
    }

    #[test]
    fn mi_reply_without_the_marker_is_silent() {
        let reply = "&\"list main.c:12,12\\n\"\n^error,msg=\"No source file\"\n(gdb) ";
        assert_eq!(extract_source_line(reply, "main.c", 12, true), None);
    }

    #[test]
    fn console_list_reply_yields_the_line() {
        let reply = "12\t    counter += 1;\n(gdb) ";
        assert_eq!(
            extract_source_line(reply, "main.c", 12, false).as_deref(),
            Some("counter += 1;")
        );
    }

    #[test]
    fn console_reply_without_the_line_is_silent() {
        let reply = "No source file named main.c.\n(gdb) ";
        assert_eq!(extract_source_line(reply, "main.c", 12, false), None);
    }

    #[test]
    fn percent_of_zero_total_is_zero() {
        assert_eq!(percent(3, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }
}
