//! Verdicts
//!
//! Classification of guest errors into results and the repetition protocol
//! that folds several results into one outcome.

pub mod repetition;
pub mod verdict;
