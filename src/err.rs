use displaydoc::Display;

/// The BSP computation was aborted.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub struct Aborted;
