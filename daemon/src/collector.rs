//! Process enumeration (reads /proc on Linux)

pub mod linux;

pub use linux::LinuxProcessCollector;

/// Linux truncates `comm` to this many bytes.
const COMM_LEN: usize = 15;

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    pub state: char,
}

impl ProcessInfo {
    /// Basename of argv[0] with any extension stripped.
    pub fn program(&self) -> &str {
        let argv0 = self.cmdline.split(' ').next().unwrap_or_default();
        let base = argv0.rsplit('/').next().unwrap_or(argv0);
        base.split('.').next().unwrap_or(base)
    }

    /// Exact match on `comm` (accounting for kernel truncation) or on the program name.
    pub fn is_named(&self, name: &str) -> bool {
        if name.is_empty() || self.state == 'Z' {
            return false;
        }
        let truncated = truncate(name);
        self.name == truncated || self.program() == name
    }

    pub fn is_named_ignore_case(&self, name: &str) -> bool {
        if name.is_empty() || self.state == 'Z' {
            return false;
        }
        self.name.eq_ignore_ascii_case(truncate(name)) || self.program().eq_ignore_ascii_case(name)
    }
}

fn truncate(name: &str) -> &str {
    match name.char_indices().nth(COMM_LEN) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}

pub trait ProcessCollector: Send + Sync {
    fn list_processes(&self) -> Vec<ProcessInfo>;

    fn find_by_name(&self, name: &str) -> Vec<ProcessInfo> {
        self.list_processes().into_iter().filter(|p| p.is_named(name)).collect()
    }

    /// True if any process matches any of `names`, case-insensitively.
    fn any_running(&self, names: &[String]) -> bool {
        if names.is_empty() {
            return false;
        }
        self.list_processes()
            .iter()
            .any(|p| names.iter().any(|n| p.is_named_ignore_case(n)))
    }
}
