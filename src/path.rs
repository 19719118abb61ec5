//! Remote path helpers. Remote paths are always `/`-separated regardless of
//! the local platform, so these never go through `std::path` for joins.

/// Join a remote directory and a child name.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "/" {
        format!("/{}", name.trim_start_matches('/'))
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
    }
}

/// Parent of a remote path, or `/` at the root.
pub fn parent_remote(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Final component of a remote path.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// Collapse `.` segments and redundant slashes, resolve `..` lexically.
/// Never touches the remote; purely syntactic.
pub fn normalize_remote(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Split a file name into (stem, extension-with-dot). `tar.gz` style double
/// extensions are treated as a single `.gz` extension.
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// `report.txt` with counter 1 becomes `report (1).txt`.
pub fn renamed_with_counter(name: &str, counter: u32) -> String {
    let (stem, ext) = split_name(name);
    format!("{stem} ({counter}){ext}")
}

/// Per-session path resolution: relative paths against the browsing cwd,
/// `~` against the remote home directory.
#[derive(Debug, Clone)]
pub struct RemotePathResolver {
    home: String,
    cwd: String,
}

impl RemotePathResolver {
    pub fn new(home: impl Into<String>) -> Self {
        let home = home.into();
        let cwd = home.clone();
        Self { home, cwd }
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn set_cwd(&mut self, cwd: impl Into<String>) {
        self.cwd = normalize_remote(&cwd.into());
    }

    pub fn resolve(&self, path: &str) -> String {
        let expanded = if path == "~" {
            self.home.clone()
        } else if let Some(rest) = path.strip_prefix("~/") {
            join_remote(&self.home, rest)
        } else if path.starts_with('/') {
            path.to_string()
        } else {
            join_remote(&self.cwd, path)
        };
        normalize_remote(&expanded)
    }
}
