pub mod cancel;
pub mod cli;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod keylog;
pub mod media;
pub mod security;
pub mod server;
pub mod system;
pub mod system_paths;

// Test-only printing helper: expands to eprintln! during tests and debug builds.
// Usage: tprintln!("debug: {}", value);
#[cfg(any(test, debug_assertions))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ( eprintln!($($arg)*) );
}

// In release builds, provide a no-op tprintln! so calls compile without effect.
#[cfg(not(any(test, debug_assertions)))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ({
        // Preserve formatting checks in release without producing code
        if false { let _ = format!($($arg)*); }
    });
}
