use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

use super::{ProcessProbe, RawText};

/// [ProcessProbe] backed by the `sysinfo` process table. Works everywhere,
/// no platform feature required.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
        }
    }

    fn name_to_raw(name: &std::ffi::OsStr) -> RawText {
        #[cfg(unix)]
        {
            // Keep the original bytes. Process names on unix are not
            // guaranteed to be UTF-8 and the decoder wants them untouched.
            use std::os::unix::ffi::OsStrExt;
            RawText::Bytes(name.as_bytes().to_vec())
        }
        #[cfg(not(unix))]
        {
            RawText::Text(name.to_string_lossy().into_owned())
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn running_process_names(&self) -> Vec<String> {
        let Ok(mut system) = self.system.lock() else {
            return Vec::new();
        };
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut names: Vec<String> = system
            .processes()
            .values()
            .map(|process| process.name().to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    fn process_paths(&self) -> HashMap<String, PathBuf> {
        let Ok(mut system) = self.system.lock() else {
            return HashMap::new();
        };
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut paths = HashMap::new();
        for process in system.processes().values() {
            let name = process.name().to_string_lossy().into_owned();
            if name.is_empty() {
                continue;
            }
            if let Some(exe) = process.exe().filter(|exe| exe.is_absolute()) {
                paths.entry(name).or_insert_with(|| exe.to_path_buf());
            }
        }
        paths
    }

    fn name_by_pid(&self, pid: u32) -> Option<RawText> {
        let Ok(mut system) = self.system.lock() else {
            return None;
        };
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
        system
            .process(pid)
            .map(|process| Self::name_to_raw(process.name()))
    }

    fn icon_for(&self, program: &str, path: Option<PathBuf>) -> Option<Vec<u8>> {
        lookup_icon(program, path.as_deref())
    }
}

#[cfg(target_os = "linux")]
fn lookup_icon(program: &str, _path: Option<&Path>) -> Option<Vec<u8>> {
    const THEME_DIRS: [&str; 4] = [
        "/usr/share/icons/hicolor/48x48/apps",
        "/usr/share/icons/hicolor/64x64/apps",
        "/usr/share/icons/hicolor/128x128/apps",
        "/usr/share/pixmaps",
    ];

    let lowercase = program.to_lowercase();
    for dir in THEME_DIRS {
        for name in [program, lowercase.as_str()] {
            let candidate = Path::new(dir).join(format!("{name}.png"));
            match std::fs::read(&candidate) {
                Ok(data) => return Some(data),
                Err(_) => continue,
            }
        }
    }
    debug!("No icon found for {program}");
    None
}

#[cfg(not(target_os = "linux"))]
fn lookup_icon(program: &str, _path: Option<&Path>) -> Option<Vec<u8>> {
    // No icon source wired up on this platform yet. The cache stores the
    // negative answer and retries after its TTL.
    debug!("No icon source for {program} on this platform");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_names_are_deduplicated() {
        let probe = SysinfoProbe::new();
        let names = probe.running_process_names();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names.len(), sorted.len());
    }

    #[test]
    fn unknown_pid_resolves_to_none() {
        let probe = SysinfoProbe::new();
        // Linux pids max out at 2^22 by default; u32::MAX is never live.
        assert_eq!(probe.name_by_pid(u32::MAX), None);
    }
}
