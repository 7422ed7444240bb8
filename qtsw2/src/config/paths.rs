use std::path::PathBuf;

pub const ENV_PROJECT_ROOT: &str = "QTSW2_PROJECT_ROOT";
pub const ENV_LOG_DIR: &str = "QTSW2_LOG_DIR";

/// Project root: `QTSW2_PROJECT_ROOT` when set, else the process working directory.
pub fn project_root() -> PathBuf {
    std::env::var_os(ENV_PROJECT_ROOT)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// Event-log directory: `QTSW2_LOG_DIR` when set, else `{root}/logs`.
pub fn log_dir() -> PathBuf {
    std::env::var_os(ENV_LOG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| project_root().join("logs"))
}

/// Stream journal directory: `{root}/journal`.
pub fn journal_dir() -> PathBuf {
    project_root().join("journal")
}

/// Execution journal directory: `{root}/execution`.
pub fn execution_journal_dir() -> PathBuf {
    project_root().join("execution")
}
