use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashSet;

static WARNINGS_ENABLED: AtomicBool = AtomicBool::new(false);

pub(crate) fn enable() {
    WARNINGS_ENABLED.store(true, Ordering::SeqCst);
}

pub(crate) fn disable() {
    WARNINGS_ENABLED.store(false, Ordering::SeqCst);
}

pub(crate) fn enabled() -> bool {
    WARNINGS_ENABLED.load(Ordering::SeqCst)
}

pub(crate) static SEEN_MESSAGES: Mutex<Option<FxHashSet<String>>> = Mutex::new(None);

/// Warn a user, if warnings are enabled.
#[macro_export]
macro_rules! warn_user {
    ($($arg:tt)*) => {{
        use owo_colors::OwoColorize;

        if $crate::warnings::enabled() {
            let message = format!("{}", format_args!($($arg)*));
            anstream::eprintln!("{}{} {message}", "warning".yellow().bold(), ":".bold());
        }
    }};
}

/// Warn a user once per message, if warnings are enabled.
#[macro_export]
macro_rules! warn_user_once {
    ($($arg:tt)*) => {{
        use owo_colors::OwoColorize;

        if $crate::warnings::enabled() {
            let message = format!("{}", format_args!($($arg)*));
            let mut seen = $crate::warnings::SEEN_MESSAGES.lock().unwrap();
            let seen = seen.get_or_insert_with(Default::default);
            if seen.insert(message.clone()) {
                anstream::eprintln!("{}{} {message}", "warning".yellow().bold(), ":".bold());
            }
        }
    }};
}
