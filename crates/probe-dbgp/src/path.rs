//! File-path mapping between the engine's filesystem and the local one.
//!
//! The engine reports file URIs (`file:///var/www/index.php`); breakpoint
//! arguments travel the other way. The [`PathMap`] collaborator converts
//! both directions; [`PathMapper`] is the default prefix-map based
//! implementation.

/// Converts engine-side file URIs to local display paths and back.
pub trait PathMap {
    /// Map a raw remote file URI to a local path.
    fn to_local(&self, uri: &str) -> String;

    /// Map a local path to the file URI the engine expects.
    fn to_remote(&self, path: &str) -> String;
}

/// Prefix-substitution path mapper.
///
/// Each entry maps a remote path prefix to a local one. The longest
/// matching prefix wins, and only the first occurrence is replaced.
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    /// (remote prefix, local prefix), sorted longest-remote-first.
    maps: Vec<(String, String)>,
}

impl PathMapper {
    /// Build a mapper from remote → local prefix pairs.
    pub fn new(maps: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut maps: Vec<_> = maps.into_iter().collect();
        maps.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { maps }
    }

    /// A mapper that leaves paths untouched.
    pub fn identity() -> Self {
        Self::default()
    }
}

impl PathMap for PathMapper {
    fn to_local(&self, uri: &str) -> String {
        let mut path = strip_file_scheme(&percent_decode(uri));
        for (remote, local) in &self.maps {
            if path.contains(remote.as_str()) {
                path = path.replacen(remote.as_str(), local, 1);
                // Align the rest of the path with the local separator.
                if let (Some(local_sep), Some(remote_sep)) = (separator(local), separator(remote)) {
                    if local_sep != remote_sep {
                        path = path.replace(remote_sep, &local_sep.to_string());
                    }
                }
                break;
            }
        }
        path
    }

    fn to_remote(&self, path: &str) -> String {
        let mut mapped = path.to_string();
        // Longest local prefix first.
        let mut by_local: Vec<_> = self.maps.iter().collect();
        by_local.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        for (remote, local) in by_local {
            if mapped.contains(local.as_str()) {
                mapped = mapped.replacen(local.as_str(), remote, 1);
                break;
            }
        }
        // URIs always use forward slashes.
        let mapped = mapped.replace('\\', "/");
        if mapped.starts_with('/') {
            format!("file://{mapped}")
        } else {
            format!("file:///{mapped}")
        }
    }
}

/// Drop the `file:` scheme and normalise Windows drive paths.
fn strip_file_scheme(uri: &str) -> String {
    let mut path = uri.strip_prefix("file:").unwrap_or(uri);
    // file:///x → /x; Windows drive letters additionally lose the slash.
    if path.starts_with("///") {
        path = &path[2..];
    }
    if is_windows_drive(path) {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        return trimmed.replace('/', "\\");
    }
    path.to_string()
}

/// `/C:/...` or `C:/...` style paths.
fn is_windows_drive(path: &str) -> bool {
    let bytes = path.strip_prefix('/').unwrap_or(path).as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// The separator a prefix uses, if it contains one.
fn separator(prefix: &str) -> Option<char> {
    prefix.chars().find(|&c| c == '\\' || c == '/')
}

/// Decode `%XX` escapes; everything else passes through.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Some(value) = hex_pair(bytes[i + 1], bytes[i + 2]) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_pair(high: u8, low: u8) -> Option<u8> {
    let high = (high as char).to_digit(16)?;
    let low = (low as char).to_digit(16)?;
    Some((high * 16 + low) as u8)
}
