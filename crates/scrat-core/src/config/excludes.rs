/// Built-in exclude patterns, applied unconditionally on every scan.
///
/// The common set covers temp files and tool caches; each OS adds the junk
/// files its desktop environment is known to scatter around.
pub fn builtin_exclude_patterns() -> Vec<&'static str> {
    let mut patterns = vec!["*.tmp", "*.cache", ".git/", "node_modules/"];

    #[cfg(target_os = "windows")]
    patterns.extend(["Thumbs.db", "desktop.ini", "~$*", "$RECYCLE.BIN/"]);

    #[cfg(target_os = "linux")]
    patterns.extend([".Trash-*/", ".thumbnails/", "*.~lock.*", ".directory"]);

    #[cfg(target_os = "macos")]
    patterns.extend([".DS_Store", ".AppleDouble/", ".Spotlight-V100/"]);

    patterns
}
