//! End-to-end scenario tests live in `tests/`.
