//! Log macros that forward to `defmt` when the `defmt` feature is enabled and to `println!` when
//! only `debug-logs` is enabled. With neither feature the arguments are still type checked but
//! nothing is emitted.
//!
//! Format strings must stay within the common subset of `core::fmt` and `defmt`: plain `{}`,
//! `{:?}` and `{:#x}`.

macro_rules! log_with {
    ($defmt:ident, $($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        defmt::$defmt!($($arg)*);
        #[cfg(all(feature = "debug-logs", not(feature = "defmt")))]
        println!($($arg)*);
        #[cfg(not(any(feature = "defmt", feature = "debug-logs")))]
        let _ = core::format_args!($($arg)*);
    }};
}

macro_rules! trace {
    ($($arg:tt)*) => { log_with!(trace, $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { log_with!(debug, $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { log_with!(warn, $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { log_with!(error, $($arg)*) };
}
