//! Publish/subscribe primitives: the radix subscription index (C1).

pub mod index;
