use elevate::RunningAs;
use std::sync::OnceLock;

static IS_ROOT: OnceLock<bool> = OnceLock::new();

/// Whether the current process runs as root/admin. Cached on first call;
/// privileges do not change mid-process.
pub fn is_root() -> bool {
    *IS_ROOT.get_or_init(|| matches!(elevate::check(), RunningAs::Root | RunningAs::Suid))
}

/// Re-executes the process under sudo/doas/pkexec when not already root.
/// Device enumeration partially works unprivileged, but raw writes and
/// formatting do not; front-ends should call this before doing anything else.
pub fn escalate_if_needed() -> Result<(), Box<dyn std::error::Error>> {
    if !is_root() {
        elevate::escalate_if_needed()?;
    }
    Ok(())
}

/// Render a byte count for progress messages and device listings.
pub fn bytes_to_human(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
