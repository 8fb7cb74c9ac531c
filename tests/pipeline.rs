use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(20);

fn config_file(name: &str, body: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("keypipe-{}-{}.toml", std::process::id(), name));
    std::fs::write(&path, body).unwrap();
    path
}

fn keypipe(config: &PathBuf, extra: &[&str]) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_keypipe"));
    command.arg("--config").arg(config).args(extra);
    command
}

/// Start `command` with `stdin` and wait for the whole pipeline to
/// exit.  Stdout only reaches EOF once Renderer is gone too, so a
/// returned output also shows no child was left behind.
fn run_to_exit(mut command: Command, stdin: Stdio, feed: impl FnOnce(&mut Child)) -> (ExitStatus, Vec<u8>) {
    let mut child = command
        .env("RUST_LOG", "off")
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let mut stdout = child.stdout.take().unwrap();
    let reader = thread::spawn(move || {
        let mut out = Vec::new();
        stdout.read_to_end(&mut out).unwrap();
        out
    });

    feed(&mut child);

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if start.elapsed() > TIMEOUT {
            let _ = child.kill();
            panic!("pipeline did not exit");
        }
        thread::sleep(Duration::from_millis(10));
    };
    (status, reader.join().unwrap())
}

/// Feed `input` through a pipe, optionally closing it afterwards
fn session(config: &PathBuf, extra: &[&str], input: &[u8], close_stdin: bool) -> (ExitStatus, Vec<u8>) {
    let mut held = None;
    let result = run_to_exit(keypipe(config, extra), Stdio::piped(), |child| {
        let mut stdin = child.stdin.take().unwrap();
        stdin.write_all(input).unwrap();
        stdin.flush().unwrap();
        if !close_stdin {
            held = Some(stdin);
        }
    });
    drop(held);
    result
}

/// Split display output into echoed units and transformed lines
fn split_output(mut out: &[u8]) -> (Vec<u8>, Vec<Vec<u8>>) {
    let mut echo = Vec::new();
    let mut lines = Vec::new();
    while !out.is_empty() {
        if out.starts_with(b"\r\n") {
            let rest = &out[2..];
            let end = rest
                .windows(2)
                .position(|w| w == b"\r\n")
                .expect("unterminated line");
            lines.push(rest[..end].to_vec());
            out = &rest[end + 2..];
        } else {
            echo.push(out[0]);
            out = &out[1..];
        }
    }
    (echo, lines)
}

#[test]
fn test_normal_termination() {
    let config = config_file("normal", "shutdown_grace_ms = 5000\n");
    let (status, out) = session(&config, &[], b"azEhelloEabXcET", false);
    assert_eq!(status.code(), Some(0));

    let (echo, lines) = split_output(&out);
    assert_eq!(echo, b"azEhelloEabXcET".to_vec());
    assert_eq!(lines, vec![b"za".to_vec(), b"hello".to_vec(), b"zc".to_vec()]);
}

#[test]
fn test_end_of_input_shuts_down() {
    let config = config_file("eof", "shutdown_grace_ms = 5000\n");
    let (status, out) = session(&config, &[], b"abcKdeE", true);
    assert_eq!(status.code(), Some(0));

    let (echo, lines) = split_output(&out);
    assert_eq!(echo, b"abcKdeE".to_vec());
    assert_eq!(lines, vec![b"de".to_vec()]);
}

#[test]
fn test_kill_unit_interrupts_everything() {
    // Children are never force-killed inside the test timeout, so a
    // quick exit means both of them stopped on the interrupt
    let config = config_file("kill", "reap_timeout_ms = 60000\n");
    let start = Instant::now();
    let (status, _out) = session(&config, &[], b"ab\x0bcdE", false);
    assert_eq!(status.code(), Some(130));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_length_prefixed_framing() {
    let config = config_file("framing", "shutdown_grace_ms = 5000\n");
    let (status, out) = session(&config, &["--framing", "length-prefixed"], b"lazyET", false);
    assert_eq!(status.code(), Some(0));

    let (echo, lines) = split_output(&out);
    assert_eq!(echo, b"lazyET".to_vec());
    assert_eq!(lines, vec![b"lzay".to_vec()]);
}

#[test]
fn test_oversized_line_is_not_transformed() {
    let config = config_file("oversized", "shutdown_grace_ms = 5000\nline_frame_size = 4\n");
    let (status, out) = session(&config, &[], b"fitEtoolongET", false);
    assert_eq!(status.code(), Some(0));

    let (echo, lines) = split_output(&out);
    assert_eq!(echo, b"fitEtoolongET".to_vec());
    assert_eq!(lines, vec![b"fit".to_vec()]);
}

#[test]
fn test_bad_config_fails_fast() {
    let config = config_file("bad", "[keys]\nsubmit = 84\n");
    let (status, out) = session(&config, &[], b"", true);
    assert_eq!(status.code(), Some(1));
    assert!(out.is_empty());
}

#[test]
fn test_stdin_from_file() {
    let config = config_file("file", "shutdown_grace_ms = 5000\n");
    let input = std::env::temp_dir().join(format!("keypipe-{}-input.txt", std::process::id()));
    std::fs::write(&input, b"azEhiET").unwrap();

    let stdin = Stdio::from(File::open(&input).unwrap());
    let (status, out) = run_to_exit(keypipe(&config, &[]), stdin, |_| ());
    assert_eq!(status.code(), Some(0));

    let (echo, lines) = split_output(&out);
    assert_eq!(echo, b"azEhiET".to_vec());
    assert_eq!(lines, vec![b"za".to_vec(), b"hi".to_vec()]);
}

#[test]
fn test_stdin_from_dev_null() {
    let config = config_file("null", "shutdown_grace_ms = 5000\n");
    let (status, out) = run_to_exit(keypipe(&config, &[]), Stdio::null(), |_| ());
    assert_eq!(status.code(), Some(0));
    assert!(out.is_empty());
}

#[test]
fn test_bad_discovered_config_fails_fast() {
    let dir = std::env::temp_dir().join(format!("keypipe-{}-discover", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("keypipe.toml"), "framing = 5\n").unwrap();

    let mut command = Command::new(env!("CARGO_BIN_EXE_keypipe"));
    command.current_dir(&dir);
    let (status, out) = run_to_exit(command, Stdio::piped(), |child| {
        // Capture may already be gone
        let mut stdin = child.stdin.take().unwrap();
        let _ = stdin.write_all(b"azET");
    });
    assert_eq!(status.code(), Some(1));
    assert!(out.is_empty());
}
