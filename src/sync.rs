cfg_if::cfg_if! {
    if #[cfg(feature = "shuttle")] {
        pub(crate) use shuttle::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
        pub(crate) use shuttle::sync::{Condvar, Mutex};
        pub(crate) use shuttle::{hint, thread, thread_local};
    } else {
        pub(crate) use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
        pub(crate) use std::sync::{Condvar, Mutex};
        pub(crate) use std::{hint, thread, thread_local};
    }
}
