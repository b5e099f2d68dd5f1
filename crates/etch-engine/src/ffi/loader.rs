//! Platform library name resolution.
//!
//! Given a library spec from an `import`/`extern` declaration, determine the
//! platform-appropriate filename and probe the usual locations. The `c` and
//! `m` specs alias the system C and math libraries.

use std::path::Path;

/// Map a bare library name to its platform filename.
pub fn platform_library_name(name: &str) -> Vec<String> {
    // System aliases first.
    match name {
        "c" => {
            if cfg!(target_os = "macos") {
                return vec!["libSystem.dylib".to_string()];
            }
            return vec!["libc.so.6".to_string(), "libc.so".to_string()];
        }
        "m" => {
            if cfg!(target_os = "macos") {
                return vec!["libSystem.dylib".to_string()];
            }
            return vec!["libm.so.6".to_string(), "libm.so".to_string()];
        }
        _ => {}
    }
    if cfg!(target_os = "windows") {
        vec![format!("{name}.dll")]
    } else if cfg!(target_os = "macos") {
        vec![format!("lib{name}.dylib")]
    } else {
        vec![format!("lib{name}.so")]
    }
}

/// Resolve a library spec to a loadable path. Absolute and relative paths
/// with separators pass through untouched; bare names go through the platform
/// naming scheme (the dynamic linker's search path does the rest).
pub fn resolve_library_path(spec: &str) -> Option<String> {
    if spec.contains('/') || spec.contains('\\') {
        return Path::new(spec)
            .exists()
            .then(|| spec.to_string());
    }
    let candidates = platform_library_name(spec);
    // Prefer a candidate that exists in the conventional locations, but fall
    // back to the first name: dlopen searches more places than we can.
    let search_dirs = ["/usr/lib", "/usr/local/lib", "/lib", "/usr/lib/x86_64-linux-gnu"];
    for candidate in &candidates {
        for dir in &search_dirs {
            let full = Path::new(dir).join(candidate);
            if full.exists() {
                return Some(full.to_string_lossy().into_owned());
            }
        }
    }
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_names() {
        let names = platform_library_name("curl");
        assert_eq!(names.len(), 1);
        if cfg!(target_os = "windows") {
            assert_eq!(names[0], "curl.dll");
        } else if cfg!(target_os = "macos") {
            assert_eq!(names[0], "libcurl.dylib");
        } else {
            assert_eq!(names[0], "libcurl.so");
        }
    }

    #[test]
    fn test_system_aliases() {
        assert!(!platform_library_name("c").is_empty());
        assert!(!platform_library_name("m").is_empty());
    }

    #[test]
    fn test_explicit_path_passthrough() {
        assert_eq!(resolve_library_path("/definitely/not/here.so"), None);
    }

    #[test]
    fn test_bare_name_always_resolves_to_candidate() {
        // Even when not found on disk, the name is handed to the dynamic
        // linker as-is.
        assert!(resolve_library_path("somelib").is_some());
    }
}
