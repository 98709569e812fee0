//! Cross-crate smoke tests live under `tests/`.
