//! Logging shim. Firmware builds log through `defmt`; hosted builds through
//! `log`; with neither feature enabled the macros compile to nothing. Callers
//! import `info!`/`warn!` from here rather than naming a backend.

#![allow(unused_macros)]

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "defmt")] {
        macro_rules! info {
            ($($arg:tt)*) => { ::defmt::info!($($arg)*) };
        }
        macro_rules! rescue_warn {
            ($($arg:tt)*) => { ::defmt::warn!($($arg)*) };
        }
    } else if #[cfg(feature = "log")] {
        macro_rules! info {
            ($($arg:tt)*) => { ::log::info!($($arg)*) };
        }
        macro_rules! rescue_warn {
            ($($arg:tt)*) => { ::log::warn!($($arg)*) };
        }
    } else {
        macro_rules! info {
            ($($arg:tt)*) => {{}};
        }
        macro_rules! rescue_warn {
            ($($arg:tt)*) => {{}};
        }
    }
}

pub(crate) use info;
pub(crate) use rescue_warn;
