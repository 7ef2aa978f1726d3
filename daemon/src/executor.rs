//! Process actions executor (launch, kill)

use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// SIGKILL `pid`.
pub fn kill(pid: u32) -> io::Result<()> {
    let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Start `program` from its own directory and return the child's pid.
///
/// A hidden launch detaches stdio; a visible one shares the daemon's terminal.
/// The child is reaped on a background thread so it never lingers as a zombie.
pub fn launch(program: &Path, visible: bool) -> io::Result<u32> {
    // resolved before the working directory changes under a relative path
    let program = program.canonicalize()?;
    let mut command = Command::new(&program);
    if let Some(dir) = program.parent() {
        command.current_dir(dir);
    }
    if visible {
        command.stdin(Stdio::null()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
    } else {
        command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    }

    let mut child = command.spawn()?;
    let pid = child.id();
    std::thread::spawn(move || match child.wait() {
        Ok(status) => debug!("Launched process {} exited: {}", pid, status),
        Err(e) => warn!("Failed to reap launched process {}: {}", pid, e),
    });
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_missing_program_fails() {
        assert!(launch(Path::new("/nonexistent/minerguard-miner"), false).is_err());
    }

    #[test]
    fn test_launch_relative_program() {
        let target = Path::new("/bin/true");
        if !target.is_file() {
            return;
        }
        let dir = tempfile::TempDir::new_in(".").unwrap();
        let program = dir.path().join("cgminer");
        std::os::unix::fs::symlink(target, &program).unwrap();
        assert!(program.is_relative());

        assert!(launch(&program, false).unwrap() > 0);
    }

    #[test]
    fn test_kill_rejects_out_of_range_pid() {
        let err = kill(u32::MAX).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
