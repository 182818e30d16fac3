use std::{env, path::Path, process::Stdio};

use anyhow::Result;
use sysinfo::{get_current_pid, Signal, System};

use super::daemon_path::to_daemon_path;

pub fn kill_previous_daemons(name: &Path) {
    let system = System::new_all();
    let current_id = get_current_pid().unwrap();
    for (pid, process) in system.processes().iter() {
        if *pid == current_id {
            continue;
        }
        if matches!(process.parent(), Some(p) if p == current_id) {
            continue;
        }

        if process
            .exe()
            .filter(|v| v.exists())
            .filter(|v| name == *v)
            .is_some()
        {
            // This will forcefully terminate the process on Windows.
            // Anything better will require a lot more work.
            if process.kill_with(Signal::Term).is_none() {
                process.kill();
            }
            process.wait();
        }
    }
}

/// Shuts down any previous daemon and starts a fresh one as a detached
/// process.
pub fn restart_daemon() -> Result<()> {
    let daemon_path = to_daemon_path(env::current_exe().expect("Can't operate without an executable"));
    kill_previous_daemons(&daemon_path);

    let mut command = std::process::Command::new(daemon_path);

    #[cfg(feature = "win")]
    {
        use std::os::windows::process::CommandExt;
        use windows::Win32::System::Threading::DETACHED_PROCESS;
        command.creation_flags(DETACHED_PROCESS.0);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
    }

    println!("Starting daemon");
    #[allow(clippy::zombie_processes)]
    let _ = command.spawn()?;
    println!("Success");
    Ok(())
}

pub fn stop_daemon() {
    let daemon_path = to_daemon_path(env::current_exe().expect("Can't operate without an executable"));
    kill_previous_daemons(&daemon_path);
}
