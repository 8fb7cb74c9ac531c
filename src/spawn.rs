//! Process launch
//!
//! Capture creates the three channels, then re-executes its own
//! binary once per child role.  A child inherits exactly the two
//! channel ends it owns: every end is close-on-exec, and in the child
//! only the inherited ones have the flag cleared before exec.  The
//! descriptor numbers, the coordinator's pid and the resolved config
//! travel in the environment.
//!
//! ```text
//!            echo              line
//! Capture ---------> Renderer <------ Transformer
//!    |                                   ^
//!    +-----------------------------------+
//!                   line
//! ```

use crate::channel::{self, ReadEnd, WriteEnd};
use crate::config::Config;
use crate::error::PipelineError;
use crate::os_glue;
use crate::role::{Peer, ProcessRole, RoleKind};
use std::env;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Channel descriptors inherited by a child, comma separated
pub const ENV_FDS: &str = "KEYPIPE_FDS";
/// Pid of the coordinating Capture process
pub const ENV_PARENT: &str = "KEYPIPE_PARENT";
/// Resolved configuration, as TOML
pub const ENV_CONFIG: &str = "KEYPIPE_CONFIG";

/// Channel ends owned by Capture
pub struct CaptureLinks {
    pub echo: WriteEnd,
    pub line: WriteEnd,
}

/// Channel ends owned by Transformer
pub struct TransformerLinks {
    pub inbound: ReadEnd,
    pub outbound: WriteEnd,
}

/// Channel ends owned by Renderer
pub struct RendererLinks {
    pub echo: ReadEnd,
    pub line: ReadEnd,
}

/// The channel ends of a spawned role, adopted from inherited FDs
pub trait Links: Sized {
    const KIND: RoleKind;

    /// # Safety
    ///
    /// `fds` must be the inherited descriptors, in launch order, and
    /// not owned by anything else in this process.
    unsafe fn adopt(fds: [RawFd; 2], config: &Config) -> std::io::Result<Self>;
}

impl Links for TransformerLinks {
    const KIND: RoleKind = RoleKind::Transformer;

    unsafe fn adopt(fds: [RawFd; 2], config: &Config) -> std::io::Result<Self> {
        Ok(Self {
            inbound: ReadEnd::from_raw_fd(fds[0], config.line_spec())?,
            outbound: WriteEnd::from_raw_fd(fds[1], config.line_spec())?,
        })
    }
}

impl Links for RendererLinks {
    const KIND: RoleKind = RoleKind::Renderer;

    unsafe fn adopt(fds: [RawFd; 2], config: &Config) -> std::io::Result<Self> {
        Ok(Self {
            echo: ReadEnd::from_raw_fd(fds[0], config.echo_spec())?,
            line: ReadEnd::from_raw_fd(fds[1], config.line_spec())?,
        })
    }
}

/// Everything a spawned role starts with
pub struct Spawned<L> {
    pub role: ProcessRole,
    pub links: L,
    pub config: Config,
}

impl<L: Links> Spawned<L> {
    /// Recover the launch data passed by Capture
    pub fn from_env() -> Result<Self, PipelineError> {
        let fds = env_var(ENV_FDS)?;
        let fds: Vec<RawFd> = fds
            .split(',')
            .map(|fd| fd.trim().parse::<RawFd>())
            .collect::<Result<_, _>>()
            .map_err(|e| PipelineError::Launch(format!("{}: {}", ENV_FDS, e)))?;
        let fds: [RawFd; 2] = fds
            .try_into()
            .map_err(|v: Vec<RawFd>| PipelineError::Launch(format!("{}: expected 2 FDs, got {}", ENV_FDS, v.len())))?;
        let parent = env_var(ENV_PARENT)?
            .parse::<u32>()
            .map_err(|e| PipelineError::Launch(format!("{}: {}", ENV_PARENT, e)))?;
        let config = Config::parse(&env_var(ENV_CONFIG)?)?;

        let links = unsafe { L::adopt(fds, &config)? };
        let role = ProcessRole::spawned(L::KIND, std::process::id(), parent);
        Ok(Self { role, links, config })
    }
}

fn env_var(name: &str) -> Result<String, PipelineError> {
    env::var(name).map_err(|_| PipelineError::Launch(format!("{} is not set", name)))
}

/// Child processes of the coordinator, reaped on drop at the latest
pub struct Children {
    procs: Vec<(RoleKind, Child)>,
}

impl Children {
    /// Wait for every child to exit.  A child still running when
    /// `timeout` expires is killed.
    pub fn reap(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        for (kind, mut child) in self.procs.drain(..) {
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        tracing::debug!(role = %kind, ?status, "reaped");
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
                    Ok(None) => {
                        tracing::warn!(role = %kind, pid = child.id(), "did not exit in time, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(role = %kind, "wait failed: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for Children {
    fn drop(&mut self) {
        for (_, child) in self.procs.iter_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// The coordinator's side of a launched pipeline
pub struct Launch {
    pub role: ProcessRole,
    pub links: CaptureLinks,
    pub children: Children,
}

/// Create the channels and spawn Renderer and Transformer from `exe`
pub fn launch(exe: &Path, config: &Config) -> Result<Launch, PipelineError> {
    let (echo_rx, echo_tx) = channel::create(config.echo_spec())?;
    let (line_rx, line_tx) = channel::create(config.line_spec())?;
    let (out_rx, out_tx) = channel::create(config.line_spec())?;
    let config_text = config.to_toml()?;
    let me = std::process::id();

    let mut children = Children { procs: Vec::new() };
    let renderer = spawn_role(
        exe,
        RoleKind::Renderer,
        &config_text,
        me,
        [echo_rx.as_raw_fd(), out_rx.as_raw_fd()],
    )?;
    children.procs.push((RoleKind::Renderer, renderer));
    // On failure here, dropping `children` kills and reaps the Renderer
    let transformer = spawn_role(
        exe,
        RoleKind::Transformer,
        &config_text,
        me,
        [line_rx.as_raw_fd(), out_tx.as_raw_fd()],
    )?;
    children.procs.push((RoleKind::Transformer, transformer));

    // Close the child-side ends in the parent, so end-of-stream is
    // seen once the owning writer exits
    drop((echo_rx, line_rx, out_rx, out_tx));

    let peers: Vec<Peer> = children
        .procs
        .iter()
        .map(|(kind, child)| Peer {
            kind: *kind,
            pid: child.id(),
        })
        .collect();
    tracing::info!(?peers, "pipeline launched");
    Ok(Launch {
        role: ProcessRole::coordinator(me, peers),
        links: CaptureLinks {
            echo: echo_tx,
            line: line_tx,
        },
        children,
    })
}

fn spawn_role(
    exe: &Path,
    kind: RoleKind,
    config_text: &str,
    parent: u32,
    keep: [RawFd; 2],
) -> Result<Child, PipelineError> {
    let mut command = Command::new(exe);
    command
        .arg("--role")
        .arg(kind.as_str())
        .env(ENV_FDS, format!("{},{}", keep[0], keep[1]))
        .env(ENV_PARENT, parent.to_string())
        .env(ENV_CONFIG, config_text)
        .stdin(Stdio::null())
        .stdout(match kind {
            RoleKind::Renderer => Stdio::inherit(),
            _ => Stdio::null(),
        })
        .stderr(Stdio::inherit());

    // In the child: keep only our two ends across exec, and hold back
    // control signals until the role has its handlers in place
    unsafe {
        command.pre_exec(move || {
            for &fd in &keep {
                channel::set_fd_flag(fd, libc::FD_CLOEXEC, false)?;
            }
            os_glue::block_control_signals()
        });
    }

    command
        .spawn()
        .map_err(|source| PipelineError::Spawn { role: kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_environment() {
        env::remove_var(ENV_FDS);
        let err = Spawned::<RendererLinks>::from_env().err().unwrap();
        assert!(matches!(err, PipelineError::Launch(_)));
    }

    #[test]
    fn test_reap_kills_stragglers() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut children = Children {
            procs: vec![(RoleKind::Renderer, child)],
        };
        let start = Instant::now();
        children.reap(Duration::from_millis(50));
        assert!(children.procs.is_empty());
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
