//! End-to-end tests for convfold live in `tests/`.
