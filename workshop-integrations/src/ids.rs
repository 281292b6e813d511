pub const BINARY_NAME: &str = "workshopd";

/// Game whose workshop packages are managed.
pub const DEFAULT_APP_ID: u32 = 294100;

pub const METADATA_DIR: &str = "About";
pub const REMOTE_ID_FILE: &str = "PublishedFileId.txt";
pub const SYNC_MARKER_FILE: &str = ".lastupdated";
pub const IGNORE_MARKER_FILE: &str = ".ignoredupdate";

pub const TOOL_NAME: &str = "steamcmd";
pub const TOOL_SCRIPT_PREFIX: &str = "workshopd_script";
