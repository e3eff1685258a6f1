pub const C_RESET: &str = "\x1b[0m";
pub const C_GRAY: &str = "\x1b[90m";
pub const C_DIM: &str = "\x1b[2m";
pub const C_RED: &str = "\x1b[31m";
pub const C_GREEN: &str = "\x1b[32m";
pub const C_YELLOW: &str = "\x1b[33m";
