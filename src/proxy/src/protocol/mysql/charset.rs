use hashbrown::HashMap;
use std::sync::OnceLock;

/// `utf8mb4_general_ci`, the default connection collation used throughout the proxy.
pub const UTF8_MB4_GENERAL_CI: u8 = 45;

/// Collation advertised in the initial handshake and in synthesized column definitions.
pub const DEFAULT_COLLATION_ID: u16 = UTF8_MB4_GENERAL_CI as u16;

/// A tiny slice of the MySQL collation table — enough to validate handshake parsing
/// and to name the collation the proxy advertises. Not an exhaustive charset registry;
/// the proxy never negotiates a charset beyond what it advertises itself.
pub fn collation_names() -> &'static HashMap<&'static str, u8> {
    static NAMES: OnceLock<HashMap<&'static str, u8>> = OnceLock::new();
    NAMES.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert("big5_chinese_ci", 1);
        m.insert("latin1_swedish_ci", 8);
        m.insert("ascii_general_ci", 11);
        m.insert("utf8_general_ci", 33);
        m.insert("binary", 63);
        m.insert("utf8mb4_general_ci", UTF8_MB4_GENERAL_CI);
        m.insert("utf8mb4_unicode_ci", 224);
        m
    })
}
