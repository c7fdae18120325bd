#[cfg(any(use_recorder, test))]
pub mod recorder;
