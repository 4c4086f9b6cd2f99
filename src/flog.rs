//! Category-based debug logging.
//!
//! Every message belongs to a category (`history`, `history_file`, `history_gc`, ...), which
//! becomes the `log` target. The `error` and `warning` categories are user-facing and are
//! emitted at a higher level; all other categories are debug output.

use log::Level;

/// Map a category name to the level its messages are logged at.
pub fn level_for(category: &str) -> Level {
    match category {
        "error" => Level::Error,
        "warning" => Level::Warn,
        _ => Level::Debug,
    }
}

/// Returns whether messages for the given category would be emitted.
pub fn is_enabled(category: &'static str) -> bool {
    log::log_enabled!(target: category, level_for(category))
}

/// Log the given values, separated by spaces, in the given category.
///
/// ```ignore
/// flog!(history, "Failed to flush:", err);
/// ```
macro_rules! flog {
    ($category:ident, $($elem:expr),+ $(,)?) => {{
        let category: &'static str = stringify!($category);
        if $crate::flog::is_enabled(category) {
            let parts: Vec<String> = vec![$(format!("{}", $elem)),+];
            ::log::log!(
                target: category,
                $crate::flog::level_for(category),
                "{}",
                parts.join(" ")
            );
        }
    }};
}

/// Log a `format!`-style message in the given category.
macro_rules! flogf {
    ($category:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let category: &'static str = stringify!($category);
        ::log::log!(target: category, $crate::flog::level_for(category), $fmt $(, $arg)*);
    }};
}

pub(crate) use {flog, flogf};
