use super::{ProcessCollector, ProcessInfo};
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxProcessCollector;

impl LinuxProcessCollector {
    pub fn new() -> Self {
        Self
    }

    fn parse_process(&self, pid: u32) -> Option<ProcessInfo> {
        let proc_path = format!("/proc/{}", pid);
        let proc_dir = Path::new(&proc_path);

        let stat_content = fs::read_to_string(proc_dir.join("stat")).ok()?;
        // comm may itself contain spaces or parentheses, so split on the outermost pair
        let open = stat_content.find('(')?;
        let close = stat_content.rfind(')')?;
        let name = stat_content.get(open + 1..close)?.to_string();
        let state = stat_content
            .get(close + 1..)?
            .split_whitespace()
            .next()
            .and_then(|s| s.chars().next())
            .unwrap_or('?');

        let cmdline = fs::read_to_string(proc_dir.join("cmdline"))
            .unwrap_or_default()
            .replace('\0', " ")
            .trim()
            .to_string();

        Some(ProcessInfo { pid, name, cmdline, state })
    }
}

impl ProcessCollector for LinuxProcessCollector {
    fn list_processes(&self) -> Vec<ProcessInfo> {
        let mut processes = Vec::new();
        if let Ok(entries) = fs::read_dir("/proc") {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(pid) = name.parse::<u32>() {
                        if let Some(info) = self.parse_process(pid) {
                            processes.push(info);
                        }
                    }
                }
            }
        }
        processes
    }
}
