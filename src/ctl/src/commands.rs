// Command name constants

// Record commands
pub const COMMAND_LIST: &str = "list";
pub const COMMAND_GET: &str = "get";
pub const COMMAND_ADD: &str = "add";
pub const COMMAND_UPDATE: &str = "update";
pub const COMMAND_DELETE: &str = "delete";
pub const COMMAND_RESTORE: &str = "restore";
pub const COMMAND_UNDO: &str = "undo";
pub const COMMAND_REDO: &str = "redo";
pub const COMMAND_HISTORY: &str = "history";

// Cluster commands
pub const COMMAND_STATUS: &str = "status";
pub const COMMAND_REPLICATE: &str = "replicate";
pub const COMMAND_DISCONNECT: &str = "disconnect";
pub const COMMAND_RECONNECT: &str = "reconnect";
pub const COMMAND_RESTORE_PRIMARY: &str = "restore-primary";
pub const COMMAND_WHOAMI: &str = "whoami";
pub const COMMAND_METRICS: &str = "metrics";

// Local configuration commands
pub const COMMAND_USE: &str = "use";
pub const COMMAND_FORGET: &str = "forget";
