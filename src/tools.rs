//! Host identity helpers, small string/number helpers and the external
//! command capture loop used by device manager adapters.

use std::process::Stdio;

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use nom::{
    branch::alt,
    bytes::complete::is_not,
    character::complete::{char, multispace0, multispace1},
    combinator::{all_consuming, map, opt},
    multi::{many1, separated_list},
    sequence::delimited,
    IResult,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

lazy_static! {
    static ref HOSTNAME: Option<String> = {
        let uts = nix::sys::utsname::uname();
        let node = uts.nodename();
        if node.is_empty() {
            None
        } else {
            // strip the domain part, catalog records use short names
            Some(node.split('.').next().unwrap_or(node).to_string())
        }
    };
}

/// Short host name (domain part stripped), queried once per process.
pub fn hostname() -> Result<&'static str, Error> {
    HOSTNAME
        .as_deref()
        .ok_or_else(|| format_err!("unable to determine host name"))
}

/// Last path component, used to derive mount point names.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Strict signed integer parse, whitespace tolerant.
pub fn parse_i64(text: &str) -> Result<i64, Error> {
    text.trim()
        .parse()
        .map_err(|err| format_err!("cannot parse '{}' as integer: {}", text, err))
}

/// Whitespace-insensitive string comparison.
///
/// Drive firmware pads model and serial fields with blanks, so identity
/// checks must ignore leading and trailing whitespace.
pub fn eq_trimmed(first: &str, second: &str) -> bool {
    first.trim() == second.trim()
}

/// True if `item` appears in a comma-separated `list`, ignoring blanks
/// around each element.
pub fn list_contains(list: &str, item: &str) -> bool {
    list.split(',').any(|entry| entry.trim() == item)
}

/// Output stream a captured line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

/// Failure classes of [`command_call`].
#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    /// Malformed command line, or the child exited with code 128
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Spawn failure, or the child exited with an unmapped nonzero code
    #[error("no child process: {0}")]
    NoChild(String),
    /// Child exited with code 126
    #[error("permission problem or command is not an executable")]
    PermissionDenied,
    /// Child exited with code 127
    #[error("command not found")]
    NoSuchFile,
    /// Child was terminated by a signal
    #[error("command terminated by signal {0}")]
    Interrupted(i32),
    /// Anything else
    #[error("i/o error: {0}")]
    Io(String),
}

fn single_quoted(input: &str) -> IResult<&str, String> {
    delimited(
        char('\''),
        map(opt(is_not("'")), |text: Option<&str>| {
            text.unwrap_or("").to_string()
        }),
        char('\''),
    )(input)
}

fn double_quoted(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        map(opt(is_not("\"")), |text: Option<&str>| {
            text.unwrap_or("").to_string()
        }),
        char('"'),
    )(input)
}

fn bare_fragment(input: &str) -> IResult<&str, String> {
    map(is_not(" \t\r\n'\""), |text: &str| text.to_string())(input)
}

fn word(input: &str) -> IResult<&str, String> {
    map(
        many1(alt((single_quoted, double_quoted, bare_fragment))),
        |fragments| fragments.concat(),
    )(input)
}

/// Split a command line into an argument vector, honouring single and
/// double quotes.
pub fn split_command_line(line: &str) -> Result<Vec<String>, Error> {
    let mut parser = all_consuming(delimited(
        multispace0,
        separated_list(multispace1, word),
        multispace0,
    ));

    match parser(line) {
        Ok((_rest, argv)) => Ok(argv),
        Err(err) => bail!("cannot parse command line '{}': {:?}", line, err),
    }
}

/// Run an external command and feed every line it prints on stdout or
/// stderr to `line_cb`, as the lines arrive.
///
/// The capture loop only exits once all three of: the child is reaped,
/// stdout reached end of stream, stderr reached end of stream. The
/// callback runs on the calling thread; the whole call blocks until the
/// child is done.
pub fn command_call<F>(cmd_line: &str, line_cb: F) -> Result<(), CommandError>
where
    F: FnMut(OutputChannel, &str),
{
    let argv = split_command_line(cmd_line)
        .map_err(|err| CommandError::InvalidArgument(err.to_string()))?;
    if argv.is_empty() {
        return Err(CommandError::InvalidArgument(format!(
            "empty command line '{}'",
            cmd_line
        )));
    }

    log::debug!("spawning external command '{}'", cmd_line);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .map_err(|err| CommandError::Io(err.to_string()))?;

    runtime.block_on(capture_loop(argv, line_cb))
}

async fn capture_loop<F>(argv: Vec<String>, mut line_cb: F) -> Result<(), CommandError>
where
    F: FnMut(OutputChannel, &str),
{
    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| CommandError::NoChild(err.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CommandError::Io("missing stdout pipe".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| CommandError::Io("missing stderr pipe".to_string()))?;

    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();

    // Three completions end the loop: stdout closed, stderr closed,
    // child reaped.
    let mut pending = 3u32;
    let mut out_open = true;
    let mut err_open = true;
    let mut status = None;

    while pending > 0 {
        tokio::select! {
            line = out_lines.next_line(), if out_open => {
                match line {
                    Ok(Some(text)) => line_cb(OutputChannel::Stdout, &text),
                    Ok(None) => { out_open = false; pending -= 1; }
                    Err(err) => {
                        log::error!("cannot read from child stdout: {}", err);
                        out_open = false;
                        pending -= 1;
                    }
                }
            }
            line = err_lines.next_line(), if err_open => {
                match line {
                    Ok(Some(text)) => line_cb(OutputChannel::Stderr, &text),
                    Ok(None) => { err_open = false; pending -= 1; }
                    Err(err) => {
                        log::error!("cannot read from child stderr: {}", err);
                        err_open = false;
                        pending -= 1;
                    }
                }
            }
            reaped = child.wait(), if status.is_none() => {
                status = Some(reaped.map_err(|err| CommandError::Io(err.to_string()))?);
                pending -= 1;
            }
        }
    }

    match status {
        Some(status) => child_status_result(status),
        None => Err(CommandError::Io("child status not collected".to_string())),
    }
}

/// Translate a child exit status into the error classification callers
/// act upon.
fn child_status_result(status: std::process::ExitStatus) -> Result<(), CommandError> {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = status.code() {
        match code {
            0 => Ok(()),
            126 => Err(CommandError::PermissionDenied),
            127 => Err(CommandError::NoSuchFile),
            128 => Err(CommandError::InvalidArgument(
                "invalid argument to exit".to_string(),
            )),
            other => Err(CommandError::NoChild(format!(
                "external command exited with code {}",
                other
            ))),
        }
    } else if let Some(signal) = status.signal() {
        Err(CommandError::Interrupted(signal))
    } else {
        Err(CommandError::Io("unexpected child status".to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_plain_words() {
        let argv = split_command_line("mtx -f /dev/sg3 status").unwrap();
        assert_eq!(argv, vec!["mtx", "-f", "/dev/sg3", "status"]);
    }

    #[test]
    fn split_quoted_words() {
        let argv = split_command_line("sh -c 'echo \"a b\"'").unwrap();
        assert_eq!(argv, vec!["sh", "-c", "echo \"a b\""]);

        let argv = split_command_line("label 'part one'\" and two\"").unwrap();
        assert_eq!(argv, vec!["label", "part one and two"]);
    }

    #[test]
    fn split_rejects_unbalanced_quotes() {
        assert!(split_command_line("echo 'oops").is_err());
    }

    #[test]
    fn split_empty_line() {
        assert_eq!(split_command_line("").unwrap(), Vec::<String>::new());
        assert_eq!(split_command_line("   ").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn capture_both_channels() {
        let mut lines = Vec::new();
        command_call("/bin/sh -c 'echo out1; echo err1 1>&2; echo out2'", |chan, line| {
            lines.push((chan, line.to_string()));
        })
        .unwrap();

        let stdout: Vec<_> = lines
            .iter()
            .filter(|(chan, _)| *chan == OutputChannel::Stdout)
            .map(|(_, line)| line.as_str())
            .collect();
        let stderr: Vec<_> = lines
            .iter()
            .filter(|(chan, _)| *chan == OutputChannel::Stderr)
            .map(|(_, line)| line.as_str())
            .collect();

        assert_eq!(stdout, vec!["out1", "out2"]);
        assert_eq!(stderr, vec!["err1"]);
    }

    #[test]
    fn capture_exit_codes() {
        let sink = |_chan: OutputChannel, _line: &str| {};

        command_call("/bin/true", sink).unwrap();

        match command_call("/bin/sh -c 'exit 3'", sink) {
            Err(CommandError::NoChild(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        match command_call("/bin/sh -c 'exit 126'", sink) {
            Err(CommandError::PermissionDenied) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        match command_call("/bin/sh -c 'exit 127'", sink) {
            Err(CommandError::NoSuchFile) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        match command_call("/surely/not/there", sink) {
            Err(CommandError::NoChild(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        match command_call("/bin/sh -c 'kill -TERM $$'", sink) {
            Err(CommandError::Interrupted(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn helpers() {
        assert_eq!(basename("/dev/st0"), "st0");
        assert_eq!(basename("st0"), "st0");
        assert_eq!(parse_i64(" 42 ").unwrap(), 42);
        assert!(parse_i64("42k").is_err());
        assert!(eq_trimmed("ULT3580-TD5   ", "ULT3580-TD5"));
        assert!(!eq_trimmed("ULT3580-TD5", "ULT3580-TD6"));
        assert!(list_contains("LTO5_drive, LTO6_drive", "LTO6_drive"));
        assert!(!list_contains("LTO5_drive", "LTO6_drive"));
        assert!(!hostname().unwrap().is_empty());
    }
}
